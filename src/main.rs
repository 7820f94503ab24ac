#[tokio::main]
async fn main() {
    if let Err(err) = gradeflow::run_worker().await {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}
