use runsec::cli;

#[tokio::main]
async fn main() {
    let options = cli::parse_from_args();

    runsec::init_logger(options.override_log_level());

    if let Err(e) = runsec::daemon::runsecd_run(&options).await {
        cli::report_error(&e);
        std::process::exit(1);
    }
}
