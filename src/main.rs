fn main() {
    env_logger::init();

    if let Err(e) = drawdown::api::run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
