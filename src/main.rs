use clap::Parser;
use env_logger::Env;
use log::info;
use snapi::annotate::Annotator;
use snapi::server::{self, AppState};
use snapi::{Args, ModelRegistry, ModelsConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ModelsConfig::load_or_empty(&args.config);

    let registry = ModelRegistry::load(&config, &args.detector_config());
    info!("{}/{} models ready.", registry.len(), config.len());

    let annotator = match &args.save_dir {
        Some(dir) => {
            let dir = dir.clone();
            Some(tokio::task::spawn_blocking(move || Annotator::new(dir, 0)).await??)
        }
        None => None,
    };
    let state = Arc::new(AppState::new(
        config,
        registry,
        args.fetch_options(),
        annotator,
    ));

    let (addr, serving) = warp::serve(server::routes(state)).bind_with_graceful_shutdown(
        (args.host, args.port),
        async {
            tokio::signal::ctrl_c().await.ok();
        },
    );
    info!("Detection server started on http://{addr}");
    serving.await;
    info!("Detection server stopped.");

    Ok(())
}
