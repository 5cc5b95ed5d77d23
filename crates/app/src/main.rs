fn main() {
    match waifu2x_app::run_from_env() {
        Ok(summary) if summary.failed > 0 => std::process::exit(1),
        Ok(_) => {}
        Err(error) => {
            tracing::error!("{error:#}");
            std::process::exit(1);
        }
    }
}
