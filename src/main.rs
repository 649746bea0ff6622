use call_filter::config::Config;
use call_filter::disposition::CallLoad;
use call_filter::pipeline::{CallFilterPipeline, FilteringOutcome};
use call_filter::statistics::StatisticsCollector;
use call_filter::{Call, Disposition};
use clap::{Arg, ArgAction, Command};
use log::LevelFilter;
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() {
    let matches = Command::new("call-filterd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Incoming call filtering: block list, direct-to-voicemail rules and call screening")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/call-filter.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-call")
                .long("test-call")
                .value_name("NUMBER")
                .help("Filter a simulated incoming call from NUMBER (repeatable)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("stdin")
                .long("stdin")
                .help("Read one number per line from stdin and filter each call")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("emergency-contact")
                .long("emergency-contact")
                .help("Filter as if an emergency call was just made (suspends blocking)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show filtering statistics")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats-reset")
                .long("stats-reset")
                .help("Reset all statistics and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .cloned()
        .unwrap_or_else(|| "/etc/call-filter.yaml".to_string());
    let config_exists = std::path::Path::new(&config_path).exists();

    let config = match load_config(&config_path, config_exists) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    // Verbose wins over the configured level
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        config
            .logging
            .as_ref()
            .and_then(|logging| logging.level.parse().ok())
            .unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if !config_exists {
        log::warn!("Configuration file '{config_path}' not found, using default configuration");
    }

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if matches.get_flag("stats") || matches.get_flag("stats-reset") {
        handle_stats(&config, matches.get_flag("stats-reset"));
        return;
    }

    let numbers: Vec<String> = matches
        .get_many::<String>("test-call")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let read_stdin = matches.get_flag("stdin");
    if numbers.is_empty() && !read_stdin {
        eprintln!("Nothing to do: pass --test-call NUMBER or --stdin (see --help)");
        process::exit(2);
    }

    let config = Arc::new(config);
    let collector = match config.statistics.as_ref().filter(|s| s.enabled) {
        Some(stats) => {
            match StatisticsCollector::new(
                stats.path.clone(),
                stats.flush_interval_seconds.unwrap_or(60),
            ) {
                Ok(collector) => {
                    log::info!("Recording statistics to {}", collector.path());
                    Some(collector)
                }
                Err(e) => {
                    log::warn!("Statistics disabled: {e:#}");
                    None
                }
            }
        }
        None => None,
    };

    let mut pipeline = match CallFilterPipeline::from_config(Arc::clone(&config)) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("❌ Failed to build filtering pipeline: {e:#}");
            process::exit(1);
        }
    };
    if let Some(collector) = &collector {
        pipeline = pipeline.with_statistics(collector.recorder());
    }
    if matches.get_flag("emergency-contact") {
        pipeline.note_emergency_contact();
    }

    log::info!(
        "Starting call filter (timeout {} ms)",
        config.call_screening_timeout_ms
    );

    let mut failed = false;
    if !numbers.is_empty() {
        failed |= !run_test_calls(&pipeline, &numbers).await;
    }
    if read_stdin {
        failed |= !run_stdin(&pipeline).await;
    }

    drop(pipeline);
    if let Some(collector) = collector {
        collector.shutdown().await;
    }

    if failed {
        process::exit(1);
    }
}

fn load_config(path: &str, exists: bool) -> anyhow::Result<Config> {
    if exists {
        Config::from_file(path)
    } else {
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();
    println!("Filtering timeout: {} ms", config.call_screening_timeout_ms);
    println!(
        "Block list: {} numbers, {} patterns",
        config.block_list.numbers.len(),
        config.block_list.patterns.len()
    );
    println!("Voicemail rules: {} numbers", config.voicemail.numbers.len());
    println!(
        "Default dialer: {}",
        config
            .screening
            .default_dialer
            .as_deref()
            .unwrap_or("(none)")
    );
    for service in &config.screening.services {
        println!("  Screening service: {}", service.component);
    }

    match config.validate() {
        Ok(()) => println!("✅ Configuration is valid"),
        Err(e) => {
            println!("❌ Configuration validation failed:");
            println!("Error: {e:#}");
            process::exit(1);
        }
    }
}

fn handle_stats(config: &Config, reset: bool) {
    let Some(stats_config) = config.statistics.as_ref().filter(|s| s.enabled) else {
        println!("❌ Statistics are not enabled in configuration");
        process::exit(1);
    };

    if reset {
        match StatisticsCollector::reset(&stats_config.path) {
            Ok(()) => println!("✅ Statistics reset successfully"),
            Err(e) => {
                println!("❌ Failed to reset statistics: {e:#}");
                process::exit(1);
            }
        }
        return;
    }

    let stats = match StatisticsCollector::load(&stats_config.path) {
        Ok(stats) => stats,
        Err(e) => {
            println!("❌ Failed to read statistics: {e:#}");
            process::exit(1);
        }
    };

    let pct = |n: u64| {
        if stats.total_calls == 0 {
            0.0
        } else {
            n as f64 / stats.total_calls as f64 * 100.0
        }
    };

    println!("📊 Call Filter Statistics");
    println!("═══════════════════════════════════════");
    println!("  Total Calls Filtered: {}", stats.total_calls);
    println!("  ├─ Allowed: {} ({:.1}%)", stats.allowed, pct(stats.allowed));
    println!("  ├─ Rejected: {} ({:.1}%)", stats.rejected, pct(stats.rejected));
    println!("  ├─ Silenced: {} ({:.1}%)", stats.silenced, pct(stats.silenced));
    println!("  └─ Timed Out: {} ({:.1}%)", stats.timed_out, pct(stats.timed_out));
    println!();
    println!("  Logged: {}", stats.logged);
    println!("  Notified: {}", stats.notified);
    println!(
        "  Average Filtering Time: {:.1} ms",
        stats.average_filtering_time_ms()
    );
    println!("  Started: {} (unix)", stats.start_time);
    println!("  Last Updated: {} (unix)", stats.last_updated);
}

/// Filter every number at once and print the outcomes in order.
async fn run_test_calls(pipeline: &CallFilterPipeline, numbers: &[String]) -> bool {
    let mut pending = Vec::with_capacity(numbers.len());
    for number in numbers {
        let call = Arc::new(Call::incoming(number));
        match pipeline.filter_incoming_call(call) {
            Ok(receiver) => pending.push((number, receiver)),
            Err(e) => {
                eprintln!("❌ Failed to filter call from {number}: {e:#}");
                return false;
            }
        }
    }

    let mut ok = true;
    for (number, receiver) in pending {
        match receiver.await {
            Ok(outcome) => print_outcome(&outcome, true),
            Err(_) => {
                eprintln!("❌ No decision for call from {number}");
                ok = false;
            }
        }
    }
    ok
}

async fn run_stdin(pipeline: &CallFilterPipeline) -> bool {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => return true,
                    Err(e) => {
                        log::error!("Failed to read stdin: {e}");
                        return false;
                    }
                };
                let number = line.trim();
                if number.is_empty() || number.starts_with('#') {
                    continue;
                }
                match pipeline.filter(Arc::new(Call::incoming(number))).await {
                    Ok(outcome) => print_outcome(&outcome, false),
                    Err(e) => log::error!("Failed to filter call from {number}: {e:#}"),
                }
            }
            _ = &mut ctrl_c => {
                log::info!("Received shutdown signal, stopping");
                return true;
            }
        }
    }
}

fn print_outcome(outcome: &FilteringOutcome, with_events: bool) {
    let call = &outcome.call;
    let disposition = Disposition::for_result(&outcome.result, false, &CallLoad::default());

    println!(
        "📞 {} ({})",
        call.number().unwrap_or("unknown"),
        call.id()
    );
    println!("  Result: {}", outcome.result);
    println!("  Disposition: {disposition}");
    if outcome.timed_out {
        println!(
            "  ⏱  Timed out after {} ms",
            outcome.elapsed.as_millis()
        );
    }
    if with_events {
        println!("  Events:");
        for event in call.event_trail() {
            match &event.detail {
                Some(detail) => println!("    +{:>5}ms {} ({detail})", event.offset_ms, event.kind),
                None => println!("    +{:>5}ms {}", event.offset_ms, event.kind),
            }
        }
    }
    println!();
}
