//! Transform delegate interface (consumed from the application layer,
//! spec §6): an optional hook the manager (C6) consults before and
//! after a successful download.

use crate::codec::DecodedImage;

/// Application-supplied hook for gating and post-processing downloads.
/// Both methods run on the transform executor (a blocking-pool task),
/// never on the main or IO executors.
pub trait TransformDelegate: Send + Sync {
    /// Whether a download should even be attempted for `url`. Consulted
    /// only on a cache miss; absence of a delegate behaves as `true`.
    fn should_download_for(&self, url: &str) -> bool {
        let _ = url;
        true
    }

    /// Transforms a freshly downloaded image before it's stored and
    /// delivered. Returning the input unchanged is a valid transform;
    /// the manager compares by pointer identity (`Arc::ptr_eq`) to
    /// decide whether the persisted bytes need recalculating.
    fn transform_downloaded(&self, image: DecodedImage, url: &str) -> DecodedImage {
        let _ = url;
        image
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_double {
    use super::*;

    /// A transform delegate that inverts every pixel's RGB channels,
    /// for asserting that the manager's transform path actually runs.
    pub struct InvertingDelegate {
        pub allow_downloads: bool,
    }

    impl TransformDelegate for InvertingDelegate {
        fn should_download_for(&self, _url: &str) -> bool {
            self.allow_downloads
        }

        fn transform_downloaded(&self, image: DecodedImage, _url: &str) -> DecodedImage {
            image.inverted()
        }
    }
}
