use std::io::Write;

/// Installs the global logger. `RUST_LOG` takes precedence over `debug`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(debug: bool) {
    let filter = if debug { "debug" } else { "info" };

    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} [{}] {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.module_path().unwrap_or("unknown"),
                record.args()
            )
        })
        .try_init();
}
