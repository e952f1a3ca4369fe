use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use image::{DynamicImage, Rgba, RgbaImage};
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use favicon_cache::{CacheConfig, FaviconCache};

#[derive(Parser)]
#[command(name = "favicon-cache")]
#[command(version)]
#[command(about = "Exercise and inspect the favicon bitmap cache")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path (created with defaults if missing)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Cache capacity in bytes (overrides config file)
    #[arg(long, value_name = "BYTES")]
    capacity_bytes: Option<usize>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Hammer the cache with concurrent readers and a writer
    Soak {
        /// Number of reader threads
        #[arg(short, long, default_value_t = 4)]
        readers: usize,

        /// Number of distinct icon keys
        #[arg(short, long, default_value_t = 32)]
        keys: usize,

        /// How long to run (e.g. "5s", "1m")
        #[arg(short, long, default_value = "5s", value_parser = humantime::parse_duration)]
        duration: Duration,
    },
    /// Load image files as the primaries of one key and report best fits
    Fit {
        /// Image files to load
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Icon key to store the images under
        #[arg(short, long, default_value = "local")]
        key: String,

        /// Target sizes to request
        #[arg(short, long, value_delimiter = ',', default_value = "16,24,32,48,64,128")]
        sizes: Vec<u32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("favicon_cache={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting favicon-cache v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => {
            let config = CacheConfig::load_from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            info!("Configuration loaded from: {}", path.display());
            config
        }
        None => CacheConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(capacity_bytes) = cli.capacity_bytes {
        config.capacity_bytes = capacity_bytes;
    }
    config.validate()?;

    let cache = FaviconCache::from_config(&config);
    match cli.command {
        Command::Soak {
            readers,
            keys,
            duration,
        } => soak(&cache, readers, keys, duration)?,
        Command::Fit { files, key, sizes } => fit(&cache, &files, &key, &sizes)?,
    }

    println!("{}", toml::to_string_pretty(&cache.stats())?);
    Ok(())
}

/// Solid icon whose color encodes its key, so a mixed bitmap is detectable.
fn solid_icon(key_index: usize, edge: u32) -> DynamicImage {
    let shade = (key_index * 37 % 200) as u8 + 40;
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(edge, edge, Rgba([shade, 255 - shade, 90, 255])))
}

fn is_uniform(bitmap: &DynamicImage) -> bool {
    let rgba = bitmap.to_rgba8();
    let mut pixels = rgba.pixels();
    let Some(first) = pixels.next() else {
        return true;
    };
    pixels.all(|pixel| {
        pixel
            .0
            .iter()
            .zip(first.0.iter())
            .all(|(a, b)| a.abs_diff(*b) <= 1)
    })
}

fn soak(cache: &FaviconCache, readers: usize, keys: usize, duration: Duration) -> Result<()> {
    if readers == 0 || keys == 0 {
        bail!("soak needs at least one reader and one key");
    }
    info!(
        "Soaking cache with {} readers over {} keys for {}",
        readers,
        keys,
        humantime::format_duration(duration)
    );

    let stop = AtomicBool::new(false);
    let lookups = AtomicU64::new(0);
    let torn = AtomicU64::new(0);
    let writes = AtomicU64::new(0);
    let started = Instant::now();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let mut rng = rand::rng();
            while !stop.load(Ordering::Relaxed) {
                let key_index = rng.random_range(0..keys);
                let key = format!("https://icon-{key_index}.example/favicon.ico");
                if rng.random_bool(0.05) {
                    cache.put_failure(&key);
                } else {
                    let count = rng.random_range(1..=3);
                    let icons = (0..count).map(|_| solid_icon(key_index, rng.random_range(8..=96)));
                    cache.put_primaries(&key, icons.collect::<Vec<_>>());
                }
                writes.fetch_add(1, Ordering::Relaxed);
            }
        });

        for _ in 0..readers {
            scope.spawn(|| {
                let mut rng = rand::rng();
                while !stop.load(Ordering::Relaxed) {
                    let key = format!("https://icon-{}.example/favicon.ico", rng.random_range(0..keys));
                    if cache.is_failed(&key) {
                        continue;
                    }
                    if let Some(bitmap) = cache.get_best_fit(&key, rng.random_range(8..=128)) {
                        if !is_uniform(&bitmap) {
                            torn.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    lookups.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        while started.elapsed() < duration {
            std::thread::sleep(Duration::from_millis(50));
        }
        stop.store(true, Ordering::Relaxed);
    });

    let torn = torn.load(Ordering::Relaxed);
    info!(
        "Soak finished: {} lookups, {} writes, {} bytes cached",
        lookups.load(Ordering::Relaxed),
        writes.load(Ordering::Relaxed),
        cache.current_size_bytes()
    );
    if torn > 0 {
        bail!("{torn} lookups returned a mixed bitmap");
    }
    Ok(())
}

fn fit(cache: &FaviconCache, files: &[PathBuf], key: &str, sizes: &[u32]) -> Result<()> {
    let mut bitmaps = Vec::with_capacity(files.len());
    for file in files {
        let bitmap =
            image::open(file).with_context(|| format!("Failed to decode {}", file.display()))?;
        info!("Loaded {} ({}x{})", file.display(), bitmap.width(), bitmap.height());
        bitmaps.push(bitmap);
    }
    cache.put_primaries(key, bitmaps);

    for &size in sizes {
        match cache.get_best_fit(key, size) {
            Some(bitmap) => println!("{size:>5}px -> {}x{}", bitmap.width(), bitmap.height()),
            None => {
                warn!("No usable primary for {}px", size);
                println!("{size:>5}px -> miss");
            }
        }
    }
    println!("dominant color: {}", cache.get_dominant_color(key));
    Ok(())
}
