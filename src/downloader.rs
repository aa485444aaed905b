//! Downloader interface (C5, spec §6) --- the external collaborator
//! that supplies progress/completion of raw bytes and (optionally) a
//! decoded image for a URL. Only the interface is in scope; this module
//! also ships one concrete `reqwest`-backed adapter and a scriptable
//! test double.

use bitflags::bitflags;

use crate::codec::{DecodedImage, ImageBytes};
use crate::error::DownloaderError;
use crate::operation::Operation;

bitflags! {
    /// One-for-one mapping target of [`crate::manager::ManagerOptions`]
    /// (spec §4.5 step 4). Reqwest has no native request-priority
    /// concept, so the priority flags are honored only as a hint for
    /// which tokio task priority to spawn under. `ContinueInBackground`
    /// is accepted but has no effect in [`ReqwestDownloader`] --- it
    /// names an OS background-task-scheduling concern with no tokio
    /// equivalent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DownloaderOptions: u32 {
        const LOW_PRIORITY = 1 << 0;
        const HIGH_PRIORITY = 1 << 1;
        const PROGRESSIVE = 1 << 2;
        const CONTINUE_IN_BACKGROUND = 1 << 3;
        const HANDLE_COOKIES = 1 << 4;
        const ALLOW_INVALID_CERTIFICATES = 1 << 5;
        /// Forces the HTTP layer to ignore its own response cache,
        /// set when the manager is refreshing a cache hit.
        const IGNORE_CACHED_RESPONSE = 1 << 6;
    }
}

/// `(received_bytes, expected_bytes)`. `expected_bytes` is `None` when
/// the server didn't supply a `Content-Length`.
pub type ProgressCallback = Box<dyn FnMut(u64, Option<u64>) + Send>;

/// `(decoded_image, raw_bytes, error, finished)`. When
/// `DownloaderOptions::PROGRESSIVE` is set and `finished` is false, this
/// may be invoked repeatedly; the last call has `finished = true`.
pub type CompletionCallback = Box<
    dyn FnMut(Option<DecodedImage>, Option<ImageBytes>, Option<DownloaderError>, bool) + Send,
>;

/// External collaborator supplying raw bytes (and, when decodable, a
/// decoded image) for a URL. Cancellation is idempotent and guarantees
/// no further callbacks.
pub trait Downloader: Send + Sync {
    fn download(
        &self,
        url: String,
        options: DownloaderOptions,
        progress: Option<ProgressCallback>,
        completion: CompletionCallback,
    ) -> Operation;
}

/// `reqwest`-backed reference adapter. Decodes the response body with
/// [`crate::codec::decode_image`] on the transform executor so the
/// completion callback always receives a decoded image alongside the
/// raw bytes when decoding succeeds.
pub struct ReqwestDownloader {
    client: reqwest::Client,
}

impl ReqwestDownloader {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    fn client_for(&self, options: DownloaderOptions) -> reqwest::Client {
        let needs_invalid_certs = options.contains(DownloaderOptions::ALLOW_INVALID_CERTIFICATES);
        let needs_cookies = options.contains(DownloaderOptions::HANDLE_COOKIES);
        if !needs_invalid_certs && !needs_cookies {
            return self.client.clone();
        }

        let mut builder = reqwest::Client::builder();
        if needs_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if needs_cookies {
            builder = builder.cookie_store(true);
        }
        builder.build().unwrap_or_else(|_| self.client.clone())
    }
}

impl Default for ReqwestDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader for ReqwestDownloader {
    fn download(
        &self,
        url: String,
        options: DownloaderOptions,
        mut progress: Option<ProgressCallback>,
        mut completion: CompletionCallback,
    ) -> Operation {
        let operation = Operation::new();
        let flag = operation.flag();
        let client = self.client_for(options);

        tokio::spawn(async move {
            if flag.is_cancelled() {
                return;
            }

            let mut request = client.get(&url);
            if options.contains(DownloaderOptions::IGNORE_CACHED_RESPONSE) {
                request = request.header("Cache-Control", "no-cache");
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    completion(None, None, Some(transport_error(&err)), true);
                    return;
                }
            };

            if !response.status().is_success() {
                completion(None, None, Some(DownloaderError::Http { status: response.status().as_u16() }), true);
                return;
            }

            let expected = response.content_length();
            let mut received = 0u64;
            let mut bytes = Vec::new();
            let mut stream = response;
            let progressive = options.contains(DownloaderOptions::PROGRESSIVE);

            loop {
                if flag.is_cancelled() {
                    return;
                }
                match stream.chunk().await {
                    Ok(Some(chunk)) => {
                        received += chunk.len() as u64;
                        bytes.extend_from_slice(&chunk);
                        if let Some(progress) = progress.as_mut() {
                            progress(received, expected);
                        }
                        if progressive {
                            if let Ok(partial) = crate::codec::decode_image(&bytes, &url) {
                                completion(Some(partial), None, None, false);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        completion(None, None, Some(transport_error(&err)), true);
                        return;
                    }
                }
            }

            if flag.is_cancelled() {
                return;
            }

            let decoded = crate::codec::decode_image(&bytes, &url).ok();
            completion(decoded, Some(bytes), None, true);
        });

        operation
    }
}

fn transport_error(err: &reqwest::Error) -> DownloaderError {
    if err.is_timeout() {
        DownloaderError::TimedOut
    } else if err.is_connect() {
        // DNS failure, connection refused, connect timeout: the host
        // was unreachable, not that the response was malformed.
        DownloaderError::Connection(err.to_string())
    } else {
        // Request-building, TLS/certificate, and body/decode errors
        // (is_request/is_builder/is_decode) recur on retry unchanged.
        DownloaderError::Transport(err.to_string())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_double {
    use super::*;
    use std::sync::Mutex;

    /// One scripted completion event for [`ScriptedDownloader`].
    pub struct ScriptedEvent {
        pub image: Option<DecodedImage>,
        pub bytes: Option<ImageBytes>,
        pub error: Option<DownloaderError>,
        pub finished: bool,
    }

    /// A downloader test double that replays one queued event per URL,
    /// recording every URL it was asked to fetch. The async analogue of
    /// the `resolve_subject_icon_at_with` fetch-injection pattern used
    /// for the pack's `bangumi` image cache tests.
    #[derive(Default)]
    pub struct ScriptedDownloader {
        events: Mutex<std::collections::HashMap<String, Vec<ScriptedEvent>>>,
        pub requested_urls: Mutex<Vec<String>>,
    }

    impl ScriptedDownloader {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, url: impl Into<String>, event: ScriptedEvent) {
            self.events.lock().unwrap().entry(url.into()).or_default().push(event);
        }
    }

    impl Downloader for ScriptedDownloader {
        fn download(
            &self,
            url: String,
            _options: DownloaderOptions,
            _progress: Option<ProgressCallback>,
            mut completion: CompletionCallback,
        ) -> Operation {
            self.requested_urls.lock().unwrap().push(url.clone());
            let operation = Operation::new();
            let event = self.events.lock().unwrap().get_mut(&url).and_then(|queue| {
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            });

            match event {
                Some(event) => completion(event.image, event.bytes, event.error, event.finished),
                None => completion(None, None, Some(DownloaderError::Http { status: 404 }), true),
            }

            operation
        }
    }
}
