use criterion::{black_box, criterion_group, criterion_main, Criterion};
use log::{info, LevelFilter};
use log4rs::{
    append::file::FileAppender,
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};
use nanolog::{nano_log, Logger, LoggerConfig};
use std::fs;
use std::sync::Once;
use std::time::Instant;
use tempfile::tempdir;

const ITERATIONS: usize = 100_000;
const STAGING_SIZE: usize = 4 * 1024 * 1024;

static LOGGER_INIT: Once = Once::new();

const DESCRIPTION: &str = "This is a longer description that includes some special characters !@#$^&*() \
    and provides more context about the event. It also contains some metrics like \
    CPU: 95, Memory: 2.5GB, Network: 1.2Gbps";

fn setup_log4rs(log_file: &str) {
    LOGGER_INIT.call_once(|| {
        let logfile = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{d} - {m}{n}")))
            .append(true)
            .build(log_file)
            .unwrap();

        let config = Config::builder()
            .appender(Appender::builder()
                .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(LevelFilter::Info)))
                .build("logfile", Box::new(logfile)))
            .build(Root::builder()
                .appender("logfile")
                .build(LevelFilter::Info))
            .unwrap();

        log4rs::init_config(config).unwrap();
    });
}

fn bench_log_call(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let logger = Logger::new(
        LoggerConfig::default()
            .with_output_path(dir.path().join("bench.nlog"))
            .with_staging_buffer_size(STAGING_SIZE),
    );
    logger.preallocate();

    let mut group = c.benchmark_group("Log Call");
    group.bench_function("nano_log_int", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            nano_log!(logger: logger, Notice, "Test perf: iteration=%lu", black_box(i));
        });
    });
    group.bench_function("nano_log_mixed", |b| {
        let mut i = 0i32;
        b.iter(|| {
            i += 1;
            nano_log!(
                logger: logger,
                Notice,
                "event id=%d active=%d value=%lu desc=%s",
                black_box(i),
                true,
                u64::MAX,
                DESCRIPTION
            );
        });
    });
    group.bench_function("filtered_out", |b| {
        b.iter(|| nano_log!(logger: logger, Debug, "never recorded %d", black_box(1)));
    });
    group.finish();

    logger.sync().unwrap();
}

fn bench_logging_comparison(c: &mut Criterion) {
    let mut group = c.benchmark_group("Logging Comparison");
    group.sample_size(10); // Fewer samples due to I/O operations

    group.bench_function("binary_vs_traditional", |b| {
        b.iter(|| {
            let dir = tempdir().unwrap();
            let binary_path = dir.path().join("binary.nlog");
            let traditional_log_dir = dir.path().join("logs");
            let _ = fs::create_dir(&traditional_log_dir);

            let logger = Logger::new(
                LoggerConfig::default()
                    .with_output_path(&binary_path)
                    .with_staging_buffer_size(STAGING_SIZE),
            );
            logger.preallocate();

            let binary_start = Instant::now();
            for i in 0..ITERATIONS {
                nano_log!(logger: logger, Notice, "Test perf: iteration=%zu, desc=%s", i, DESCRIPTION);
            }
            let binary_call_duration = binary_start.elapsed();
            logger.sync().unwrap();
            let binary_duration = binary_start.elapsed();
            let stats = logger.statistics();
            drop(logger);

            // Traditional logging using log4rs, formatting and I/O on the caller
            let traditional_log_file = traditional_log_dir.join("traditional.log").to_str().unwrap().to_string();
            setup_log4rs(&traditional_log_file);

            let traditional_start = Instant::now();
            for i in 0..ITERATIONS {
                info!("Test perf: iteration={}, desc={}", i, DESCRIPTION);
            }
            let traditional_duration = traditional_start.elapsed();

            let binary_size = fs::metadata(&binary_path).map(|m| m.len()).unwrap_or(0);
            println!("\nPerformance comparison ({} iterations):", ITERATIONS);
            println!("Binary logging (calls only): {:?}", binary_call_duration);
            println!("Binary logging (until synced): {:?}", binary_duration);
            println!("Traditional logging (with I/O): {:?}", traditional_duration);
            println!("Speedup: {:.2}x", traditional_duration.as_secs_f64() / binary_call_duration.as_secs_f64());
            println!("Binary file: {} bytes, compression {:.2}x", binary_size, stats.compression_ratio);

            black_box((binary_duration, traditional_duration))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_log_call, bench_logging_comparison);
criterion_main!(benches);
