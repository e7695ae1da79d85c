use clap::{Arg, Command};
use log::LevelFilter;
use mta_policyd::server::{self, PolicyServer};
use mta_policyd::{Config, Dispatcher};
use std::process;
use std::sync::Arc;

fn main() {
    let matches = Command::new("mta-policyd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Postfix policy daemon enforcing mailing list access and sender login rules")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/mta-policyd/config.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .value_name("FILE")
                .help("Evaluate one policy request read from FILE and print the action")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as a daemon (background process)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("pid-file")
                .long("pid-file")
                .value_name("FILE")
                .help("PID file written in daemon mode")
                .default_value("/var/run/mta-policyd.pid"),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/mta-policyd/config.yaml");

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    let check_file = matches.get_one::<String>("check").cloned();

    if check_file.is_none() && matches.get_flag("daemon") {
        let pid_file = matches
            .get_one::<String>("pid-file")
            .cloned()
            .unwrap_or_else(|| "/var/run/mta-policyd.pid".to_string());
        daemonize(pid_file);
    }

    // Daemonize before the runtime spawns its worker threads.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {e}");
            process::exit(1);
        }
    };

    let result = runtime.block_on(async move {
        match check_file {
            Some(path) => check_request(&config, &path).await,
            None => serve(config).await,
        }
    });

    if let Err(e) = result {
        log::error!("Policy server error: {e:#}");
        process::exit(1);
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    log::info!("Starting mta-policyd...");
    let dispatcher = Arc::new(Dispatcher::from_config(&config).await?);
    PolicyServer::new(dispatcher)
        .run(&config.listen_address)
        .await
}

async fn check_request(config: &Config, path: &str) -> anyhow::Result<()> {
    let attrs = server::read_request_file(path)?;

    let dispatcher = Dispatcher::from_config(config).await?;
    let verdict = server::evaluate_request(&dispatcher, &attrs).await;

    println!("action={}", verdict.action_line());
    if let mta_policyd::Verdict::Default {
        reason: Some(reason),
    } = &verdict
    {
        println!("reason: {reason}");
    }
    Ok(())
}

fn test_config(config: &Config) {
    println!("Testing configuration...");
    println!("Listen address: {}", config.listen_address);
    println!("Backend: {:?}", config.backend);
    println!("Number of plugins: {}", config.plugins.len());
    for (i, plugin) in config.plugins.iter().enumerate() {
        println!("  Plugin {}: {}", i + 1, plugin);
    }

    match config.validate() {
        Ok(()) => println!("Configuration is valid."),
        Err(e) => {
            println!("Configuration validation failed:");
            println!("Error: {e:#}");
            process::exit(1);
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
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

#[cfg(unix)]
fn daemonize(pid_file: String) {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    log::info!("Starting mta-policyd in daemon mode...");

    match unsafe { libc::fork() } {
        -1 => {
            log::error!("Failed to fork process");
            process::exit(1);
        }
        0 => {}
        _ => process::exit(0),
    }

    if unsafe { libc::setsid() } == -1 {
        log::error!("Failed to create new session");
        process::exit(1);
    }

    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // Second fork so the daemon can never reacquire a controlling terminal.
    match unsafe { libc::fork() } {
        -1 => {
            log::error!("Failed to second fork");
            process::exit(1);
        }
        0 => {}
        _ => process::exit(0),
    }

    if let Err(e) = std::env::set_current_dir("/") {
        log::warn!("Failed to change working directory to /: {e}");
    }

    unsafe {
        libc::umask(0o022);
    }

    match OpenOptions::new().read(true).write(true).open("/dev/null") {
        Ok(dev_null) => {
            let null_fd = dev_null.as_raw_fd();
            unsafe {
                libc::dup2(null_fd, 0);
                libc::dup2(null_fd, 1);
                libc::dup2(null_fd, 2);
            }
            std::mem::forget(dev_null);
        }
        Err(e) => log::warn!("Failed to open /dev/null: {e}"),
    }

    let pid = unsafe { libc::getpid() };
    if let Err(e) = std::fs::write(&pid_file, pid.to_string()) {
        log::warn!("Failed to write PID file: {e}");
    } else {
        log::info!("PID file written: {pid_file} ({pid})");
    }

    let handler_pid_file = pid_file.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, cleaning up...");
        if std::path::Path::new(&handler_pid_file).exists() {
            if let Err(e) = std::fs::remove_file(&handler_pid_file) {
                log::warn!("Failed to remove PID file: {e}");
            } else {
                log::info!("PID file removed");
            }
        }
        process::exit(0);
    }) {
        log::warn!("Failed to install signal handler: {e}");
    }

    log::info!("Daemon mode initialization complete");
}

#[cfg(not(unix))]
fn daemonize(_pid_file: String) {
    log::warn!("Daemon mode not supported on this platform, running in foreground");
}
