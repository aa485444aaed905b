//! Primes the disk cache for a list of URLs and reports a summary ---
//! a small command-line driver over [`snapcache::Manager`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use snapcache::{CacheConfig, ImageCache, Manager, ManagerOptions, ReqwestDownloader};
use snapcache::executor::{IoExecutor, TokioMainExecutor};

/// Downloads every URL (one per line from stdin or a file) into a
/// snapcache namespace and prints a short summary.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache namespace to prime.
    #[arg(long, default_value = "prime-cache-demo")]
    namespace: String,

    /// Path to a newline-delimited file of URLs; reads stdin if omitted.
    #[arg(long)]
    urls_file: Option<String>,

    /// Retry URLs already on the failed-URL blacklist.
    #[arg(long)]
    retry_failed: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging();

    let urls = match &args.urls_file {
        Some(path) => std::fs::read_to_string(path).unwrap_or_else(|err| {
            warn!(%path, %err, "failed to read urls file");
            String::new()
        }),
        None => {
            use std::io::Read;
            let mut buffer = String::new();
            let _ = std::io::stdin().read_to_string(&mut buffer);
            buffer
        }
    };

    let urls: Vec<String> = urls.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect();
    info!(count = urls.len(), namespace = %args.namespace, "priming cache");

    let config = CacheConfig::builder().namespace(args.namespace).build();
    let cache = Arc::new(ImageCache::new(&config, IoExecutor::new(), Arc::new(TokioMainExecutor)));
    let manager = Manager::builder(cache, Arc::new(ReqwestDownloader::new()), Arc::new(TokioMainExecutor)).build();

    let options = if args.retry_failed { ManagerOptions::RETRY_FAILED } else { ManagerOptions::empty() };
    let succeeded = Arc::new(Mutex::new(0usize));
    let failed = Arc::new(Mutex::new(0usize));

    for url in urls {
        let succeeded = Arc::clone(&succeeded);
        let failed = Arc::clone(&failed);
        manager.download_image(
            Some(url.clone()),
            options,
            None,
            Box::new(move |image, error, _source, finished, url| {
                if !finished {
                    return;
                }
                if image.is_some() {
                    *succeeded.lock().unwrap() += 1;
                } else {
                    *failed.lock().unwrap() += 1;
                    if let Some(error) = error {
                        warn!(%url, %error, "prime_cache: download failed");
                    }
                }
            }),
        );
    }

    while manager.is_running() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    info!(succeeded = *succeeded.lock().unwrap(), failed = *failed.lock().unwrap(), "priming complete");
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}
