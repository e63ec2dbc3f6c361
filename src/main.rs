use tinyhttpd::{Server, ServerConfig, ServerError};

fn main() {
    let config = match ServerConfig::from_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tinyhttpd: {e}");
            std::process::exit(e.exit_code());
        }
    };

    if let Err(e) = tinyhttpd::logging::init(&config) {
        eprintln!("tinyhttpd: {e}");
        std::process::exit(e.exit_code());
    }

    if let Err(e) = run(config) {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(e.exit_code());
    }
}

fn run(config: ServerConfig) -> Result<(), ServerError> {
    let server = Server::bind(config)?;
    server.run()
}
