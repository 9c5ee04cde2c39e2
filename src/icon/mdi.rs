//! MDI icon resolution: ensure a `mdi:<slug>` icon's SVG is present
//! locally, fetching it at most once per missing icon (spec §4.4 step 3).

use std::path::{Path, PathBuf};

use crate::procexec::run_shell_with_timeout;

/// Fetches the SVG for an MDI slug. Abstracted so tests don't need a real
/// download tool on `PATH` — mirrors the teacher's `dyn Platform`
/// abstraction over OS-specific behavior
/// (`monitor::special_locations::SpecialLocationRegistry::discover`).
pub trait IconDownloader {
    /// Attempt to fetch `slug`'s SVG to `dest`. Returns whether the fetch
    /// succeeded; never treated as fatal by the caller either way.
    fn fetch(&self, slug: &str, dest: &Path) -> bool;
}

/// Shells out to an external `fetch_mdi_icon` tool (spec §1 "fetch web
/// resources itself... delegated to download tools").
#[derive(Debug, Clone, Copy, Default)]
pub struct SubprocessIconDownloader;

impl IconDownloader for SubprocessIconDownloader {
    fn fetch(&self, slug: &str, dest: &Path) -> bool {
        let Some(dest_str) = dest.to_str() else {
            return false;
        };
        let cmd = format!("fetch_mdi_icon {slug} {dest_str}");
        matches!(
            run_shell_with_timeout(&cmd, std::time::Duration::from_secs(10)),
            Ok(outcome) if outcome.success()
        )
    }
}

/// Resolve the local SVG path for `slug`, downloading it at most once.
///
/// A `mdi_dl_<hash>.once` marker under `cache_root` records that a fetch
/// was already attempted for this slug; once written, the daemon never
/// retries automatically (spec §4.4: "download once per missing icon into
/// a marker file to prevent loops" — the marker is written regardless of
/// whether the fetch succeeded, since a failing download is exactly the
/// loop this guards against).
pub fn ensure_local_svg(
    downloader: &dyn IconDownloader,
    cache_root: &Path,
    slug: &str,
) -> Option<PathBuf> {
    let icons_dir = cache_root.join("mdi_icons");
    let _ = std::fs::create_dir_all(&icons_dir);
    let svg_path = icons_dir.join(format!("{slug}.svg"));
    if svg_path.is_file() {
        return Some(svg_path);
    }

    let hash = crate::cache::fnv1a32(slug.as_bytes());
    let marker = cache_root.join(format!("mdi_dl_{hash:08x}.once"));
    if marker.is_file() {
        return None;
    }

    let fetched = downloader.fetch(slug, &svg_path);
    let _ = std::fs::write(&marker, b"");
    if fetched && svg_path.is_file() {
        Some(svg_path)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{ensure_local_svg, IconDownloader};
    use std::cell::Cell;
    use std::path::Path;
    use tempfile::tempdir;

    struct CountingDownloader {
        calls: Cell<u32>,
        succeed: bool,
    }

    impl IconDownloader for CountingDownloader {
        fn fetch(&self, _slug: &str, dest: &Path) -> bool {
            self.calls.set(self.calls.get() + 1);
            if self.succeed {
                std::fs::write(dest, b"<svg/>").is_ok()
            } else {
                false
            }
        }
    }

    #[test]
    fn successful_fetch_is_cached_without_marker_check() {
        let dir = tempdir().unwrap();
        let downloader = CountingDownloader {
            calls: Cell::new(0),
            succeed: true,
        };
        let path = ensure_local_svg(&downloader, dir.path(), "lightbulb");
        assert!(path.is_some());
        let path2 = ensure_local_svg(&downloader, dir.path(), "lightbulb");
        assert!(path2.is_some());
        assert_eq!(downloader.calls.get(), 1, "second call hits the svg-exists fast path");
    }

    #[test]
    fn failed_fetch_writes_marker_and_does_not_retry() {
        let dir = tempdir().unwrap();
        let downloader = CountingDownloader {
            calls: Cell::new(0),
            succeed: false,
        };
        let first = ensure_local_svg(&downloader, dir.path(), "missing-slug");
        assert!(first.is_none());
        let second = ensure_local_svg(&downloader, dir.path(), "missing-slug");
        assert!(second.is_none());
        assert_eq!(downloader.calls.get(), 1, "marker file prevents a retry loop");
    }
}
