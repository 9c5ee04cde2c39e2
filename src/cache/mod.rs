//! Render cache: the four layers spec §4.3 describes. Content- and
//! external-icon caches are persistent disk stores addressed by identity
//! (not payload — spec §9 Open Question a, preserved deliberately);
//! [`session`] is the RAM-backed mirror wiped at daemon startup;
//! [`wallpaper`] composes wallpaper tiles with per-button icons.

pub mod session;
pub mod wallpaper;

use std::path::{Path, PathBuf};

/// FNV-1a, 32-bit. Used for every content-addressed cache key in this
/// module (spec §4.3/§6): external-icon filenames, wallpaper signatures,
/// and MDI download markers. Named explicitly in the spec, not an
/// ecosystem convention we're sidestepping — there is no project-wide FNV
/// dependency in the teacher's stack to reuse, so this is a deliberate
/// from-scratch implementation of the named algorithm, same as the
/// teacher hand-rolling its own EWMA estimator.
#[must_use]
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Deterministic button-file hash for a `(page, item_index)` pair (spec §3
/// Invariant 5, §8 "Cache stability"). Depends only on `(page, item_index +
/// 1)` — never on preset/icon/text content — so editing a preset's styling
/// does NOT invalidate a previously-rendered tile for the same button
/// (spec §9 Open Question a: preserved as-is, a known footgun).
#[must_use]
pub fn item_file_hash(page: &str, item_index: usize) -> u32 {
    let button = item_index + 1;
    fnv1a32(format!("{page}:{button}").as_bytes())
}

/// Persistent content cache: `<cache_root>/<page>/<btn>-<hash>[-<variant>].png`.
#[derive(Debug, Clone)]
pub struct ContentCache {
    root: PathBuf,
}

impl ContentCache {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path for a button's base tile or a named variant (state key, or
    /// `"text"` for the dynamic-text overlay cache entry).
    #[must_use]
    pub fn path(&self, page: &str, item_index: usize, variant: Option<&str>) -> PathBuf {
        let button = item_index + 1;
        let hash = item_file_hash(page, item_index);
        let filename = match variant {
            Some(v) => format!("{button}-{hash:08x}-{v}.png"),
            None => format!("{button}-{hash:08x}.png"),
        };
        self.root.join(page).join(filename)
    }

    /// Whether a tile is already rendered on disk.
    #[must_use]
    pub fn exists(&self, page: &str, item_index: usize, variant: Option<&str>) -> bool {
        self.path(page, item_index, variant).is_file()
    }

    pub fn ensure_page_dir(&self, page: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(self.root.join(page))
    }
}

/// Disk-normalized cache for `local:`/`url:` icons: `<cache_root>/external_icons/<fnv1a32(spec)>.png`.
#[derive(Debug, Clone)]
pub struct ExternalIconCache {
    root: PathBuf,
}

/// Maximum accepted size for a normalized external icon (spec §4.3).
pub const MAX_EXTERNAL_ICON_BYTES: usize = 6 * 1024;
/// Maximum accepted edge length for a normalized external icon.
pub const MAX_EXTERNAL_ICON_EDGE: u32 = 196;

impl ExternalIconCache {
    #[must_use]
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            root: cache_root.into().join("external_icons"),
        }
    }

    #[must_use]
    pub fn path(&self, spec: &str) -> PathBuf {
        let hash = fnv1a32(spec.as_bytes());
        self.root.join(format!("{hash:08x}.png"))
    }

    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// Validate a candidate normalized icon against spec §4.3's rules:
    /// exists, non-empty, `<= 6 KiB`, square, `<= 196x196`.
    #[must_use]
    pub fn validate(path: &Path) -> Result<(u32, u32), &'static str> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(_) => return Err("missing"),
        };
        if bytes.is_empty() {
            return Err("empty");
        }
        if bytes.len() > MAX_EXTERNAL_ICON_BYTES {
            return Err("too_large");
        }
        let Some((w, h)) = png_dimensions(&bytes) else {
            return Err("not_png");
        };
        if w != h {
            return Err("not_square");
        }
        if w > MAX_EXTERNAL_ICON_EDGE || h > MAX_EXTERNAL_ICON_EDGE {
            return Err("too_wide");
        }
        Ok((w, h))
    }
}

/// Read `(width, height)` from a PNG's IHDR chunk without decoding pixel
/// data. Reading image codecs is an explicit non-goal (spec §1) — this is
/// metadata-only header parsing, the minimum needed to enforce the
/// dimension/squareness rule in [`ExternalIconCache::validate`].
#[must_use]
pub fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    if bytes.len() < 8 + 8 + 13 || bytes[..8] != SIGNATURE {
        return None;
    }
    // IHDR is always the first chunk: 4-byte length, 4-byte type "IHDR",
    // then width(4) height(4) as big-endian u32.
    let chunk_type = &bytes[12..16];
    if chunk_type != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(bytes[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(bytes[20..24].try_into().ok()?);
    Some((width, height))
}

/// 1x1 transparent PNG used as the empty-button fill (spec §4.3
/// "Transparent button fill"). Expanded to 196x196 by the icon pipeline
/// whenever text must be drawn over it.
pub const EMPTY_PNG_1X1: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, b'I', b'H', b'D', b'R',
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15, 0xc4,
    0x89, 0x00, 0x00, 0x00, 0x0a, b'I', b'D', b'A', b'T', 0x78, 0x9c, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, b'I', b'E', b'N', b'D', 0xae,
    0x42, 0x60, 0x82,
];

#[cfg(test)]
mod tests {
    use super::{png_dimensions, ContentCache, ExternalIconCache, EMPTY_PNG_1X1, fnv1a32, item_file_hash};
    use tempfile::tempdir;

    #[test]
    fn hash_depends_only_on_page_and_button_number() {
        let a = item_file_hash("$root", 2);
        let b = item_file_hash("$root", 2);
        assert_eq!(a, b);
        let c = item_file_hash("$root", 3);
        assert_ne!(a, c);
    }

    #[test]
    fn content_cache_path_is_stable_across_restarts() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path());
        let p1 = cache.path("$root", 0, None);
        let cache2 = ContentCache::new(dir.path());
        let p2 = cache2.path("$root", 0, None);
        assert_eq!(p1, p2);
    }

    #[test]
    fn variant_path_differs_from_base() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path());
        let base = cache.path("$root", 0, None);
        let variant = cache.path("$root", 0, Some("off"));
        assert_ne!(base, variant);
    }

    #[test]
    fn fnv1a32_matches_known_vector() {
        // "" -> FNV-1a 32-bit offset basis.
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
    }

    #[test]
    fn empty_png_has_sane_dimensions() {
        assert_eq!(png_dimensions(EMPTY_PNG_1X1), Some((1, 1)));
    }

    #[test]
    fn external_icon_rejects_oversized() {
        let dir = tempdir().unwrap();
        let cache = ExternalIconCache::new(dir.path());
        let path = cache.path("local:/icons/foo.png");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![0u8; super::MAX_EXTERNAL_ICON_BYTES + 1]).unwrap();
        assert_eq!(ExternalIconCache::validate(&path), Err("too_large"));
    }

    #[test]
    fn external_icon_accepts_square_small_png() {
        let dir = tempdir().unwrap();
        let cache = ExternalIconCache::new(dir.path());
        let path = cache.path("local:/icons/bar.png");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, EMPTY_PNG_1X1).unwrap();
        assert_eq!(ExternalIconCache::validate(&path), Ok((1, 1)));
    }
}
