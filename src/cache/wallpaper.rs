//! Wallpaper composition cache: persistent `nav/` entries plus a RAM
//! mirror under `wp_comp/` (spec §4.3 layer 4).

use std::path::PathBuf;

use super::fnv1a32;
use crate::core::config::Wallpaper;

/// Content-addressed signature for one wallpaper configuration (spec
/// §4.3: `wp_sig = fnv1a32("path:<p>\nq:<q>\nm:<m>\nd:<0|1>\n")`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WallpaperSignature(pub u32);

impl WallpaperSignature {
    #[must_use]
    pub fn compute(wallpaper: &Wallpaper) -> Self {
        let material = format!(
            "path:{}\nq:{}\nm:{}\nd:{}\n",
            wallpaper.path,
            wallpaper.quality,
            wallpaper.magnify,
            u8::from(wallpaper.dithering)
        );
        Self(fnv1a32(material.as_bytes()))
    }
}

/// Paths into the persistent wallpaper cache and its RAM mirror.
#[derive(Debug, Clone)]
pub struct WallpaperCache {
    cache_root: PathBuf,
}

impl WallpaperCache {
    #[must_use]
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
        }
    }

    /// `nav/<page>/<nav>_<wp_sig>_<pos>.png` — a navigation button's
    /// wallpaper-composited tile (`nav` is one of `back`/`prev`/`next`).
    #[must_use]
    pub fn nav_path(&self, page: &str, nav: &str, sig: WallpaperSignature, pos: u8) -> PathBuf {
        self.cache_root
            .join("nav")
            .join(page)
            .join(format!("{nav}_{:08x}_{pos}.png", sig.0))
    }

    /// `wp_comp/<wp_sig>/<pos>/<pos>_<base>.png` — a content button's
    /// wallpaper tile composed with the base icon identified by `base_hash`
    /// (the button's content-cache hash, see [`super::item_file_hash`]).
    #[must_use]
    pub fn comp_path(&self, sig: WallpaperSignature, pos: u8, base_hash: u32) -> PathBuf {
        self.cache_root
            .join("wp_comp")
            .join(format!("{:08x}", sig.0))
            .join(pos.to_string())
            .join(format!("{pos}_{base_hash:08x}.png"))
    }

    pub fn ensure_dirs(&self, page: &str, sig: WallpaperSignature, pos: u8) -> std::io::Result<()> {
        std::fs::create_dir_all(self.cache_root.join("nav").join(page))?;
        std::fs::create_dir_all(
            self.cache_root
                .join("wp_comp")
                .join(format!("{:08x}", sig.0))
                .join(pos.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{WallpaperCache, WallpaperSignature};
    use crate::core::config::Wallpaper;

    fn wp(path: &str) -> Wallpaper {
        Wallpaper {
            path: path.to_string(),
            quality: 85,
            magnify: 100,
            dithering: false,
        }
    }

    #[test]
    fn signature_changes_with_path() {
        let a = WallpaperSignature::compute(&wp("/wp/a.png"));
        let b = WallpaperSignature::compute(&wp("/wp/b.png"));
        assert_ne!(a, b);
    }

    #[test]
    fn signature_stable_for_identical_config() {
        let a = WallpaperSignature::compute(&wp("/wp/a.png"));
        let b = WallpaperSignature::compute(&wp("/wp/a.png"));
        assert_eq!(a, b);
    }

    #[test]
    fn nav_and_comp_paths_differ() {
        let cache = WallpaperCache::new("/cache");
        let sig = WallpaperSignature::compute(&wp("/wp/a.png"));
        let nav = cache.nav_path("$root", "next", sig, 13);
        let comp = cache.comp_path(sig, 3, 0xdead_beef);
        assert_ne!(nav, comp);
        assert!(nav.to_string_lossy().contains("nav"));
        assert!(comp.to_string_lossy().contains("wp_comp"));
    }
}
