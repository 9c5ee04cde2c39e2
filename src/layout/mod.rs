//! Sheet pagination layout (spec §4.2).
//!
//! Pure, total function from `(total_items, show_back, desired_offset)` to
//! a [`SheetLayout`]. No I/O, no config dependency beyond the raw counts —
//! kept this way so the property tests in spec §8 can exhaustively check
//! every `(total_items, show_back)` pair without constructing a `Config`.

/// Total content + nav positions available on the device.
pub const TOTAL_POSITIONS: u8 = 13;

/// Layout of one visible sheet (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetLayout {
    /// First item index (0-based) shown on this sheet.
    pub start: usize,
    /// Number of content positions on this sheet.
    pub cap: usize,
    /// Whether a "previous sheet" button is visible.
    pub show_prev: bool,
    /// Whether a "next sheet" button is visible.
    pub show_next: bool,
    /// `start` of the previous sheet, clamped to 0 at the first sheet.
    pub prev_start: usize,
    /// `start` of the next sheet, clamped to the last sheet's start at the
    /// end.
    pub next_start: usize,
}

/// One sheet's raw allocation before prev/next-start back-references are
/// resolved across the whole run.
struct RawSheet {
    start: usize,
    cap: usize,
    show_prev: bool,
    show_next: bool,
}

fn base_slots(show_back: bool) -> usize {
    (TOTAL_POSITIONS as usize - usize::from(show_back)).max(1)
}

/// Compute every sheet for a page with `total_items` items. Internal
/// helper shared by [`compute_sheet_layout`] and the exhaustive property
/// tests — the single-sheet early return mirrors spec §4.2 exactly ("If
/// `total_items <= base_slots`: single sheet, no prev/next").
fn compute_all_sheets(total_items: usize, show_back: bool) -> Vec<RawSheet> {
    let slots = base_slots(show_back);
    if total_items <= slots {
        return vec![RawSheet {
            start: 0,
            cap: slots,
            show_prev: false,
            show_next: false,
        }];
    }

    let mut sheets = Vec::new();
    let mut start = 0usize;
    let mut index = 0usize;
    loop {
        let show_prev = index > 0;
        // A sheet reserves "next" unless it's the last one needed. We don't
        // know yet whether more items remain after this sheet's capacity,
        // so reserve next optimistically and shrink back later only if the
        // remaining items after this sheet's (next-reserving) cap turn out
        // to be zero.
        let reserved_prev = usize::from(show_prev);
        let cap_with_next = (slots - reserved_prev - 1).max(1);
        let remaining_after = total_items.saturating_sub(start + cap_with_next);
        let show_next = remaining_after > 0;
        let cap = if show_next {
            cap_with_next
        } else {
            (slots - reserved_prev).max(1)
        };

        sheets.push(RawSheet {
            start,
            cap,
            show_prev,
            show_next,
        });

        if !show_next {
            break;
        }
        start += cap;
        index += 1;
    }
    sheets
}

/// Compute the [`SheetLayout`] that should be shown for `desired_offset`
/// (spec §4.2 "Selection").
#[must_use]
pub fn compute_sheet_layout(total_items: usize, show_back: bool, desired_offset: usize) -> SheetLayout {
    let sheets = compute_all_sheets(total_items, show_back);
    let selected = sheets
        .iter()
        .position(|s| s.start == desired_offset)
        .or_else(|| {
            sheets
                .iter()
                .position(|s| desired_offset >= s.start && desired_offset < s.start + s.cap)
        })
        .unwrap_or(0);

    let prev_start = if selected == 0 {
        0
    } else {
        sheets[selected - 1].start
    };
    let next_start = if selected + 1 < sheets.len() {
        sheets[selected + 1].start
    } else {
        sheets[selected].start
    };

    let s = &sheets[selected];
    SheetLayout {
        start: s.start,
        cap: s.cap,
        show_prev: s.show_prev,
        show_next: s.show_next,
        prev_start,
        next_start,
    }
}
