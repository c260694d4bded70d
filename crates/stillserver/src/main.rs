mod routes;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use stillcore::transport::{ChannelTransport, IggyTransport, IggyTransportConfig};
use stillruntime::{FlowRuntime, RuntimeConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Iggy transport when `STILLFLOW_IGGY_URL` is set, in-process otherwise.
async fn transport() -> anyhow::Result<Option<Arc<dyn ChannelTransport>>> {
    let Ok(connection_string) = std::env::var("STILLFLOW_IGGY_URL") else {
        return Ok(None);
    };
    let config = IggyTransportConfig {
        connection_string,
        ..IggyTransportConfig::default()
    };
    let transport = IggyTransport::connect(config).await?;
    Ok(Some(Arc::new(transport)))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting stillflow server");

    let config = RuntimeConfig::from_env()?;
    let mut builder = FlowRuntime::builder()
        .config(config)
        .registry(stillnodes::standard_registry());
    if let Some(transport) = transport().await? {
        builder = builder.transport(transport);
    }
    let runtime = Arc::new(builder.build().await?);
    runtime.start().await?;

    info!(
        nodes = runtime.registry().list_node_types().len(),
        "Runtime initialized with standard nodes"
    );

    let app_state = web::Data::new(routes::AppState {
        runtime: Arc::clone(&runtime),
    });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(routes::configure)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    runtime.shutdown().await?;
    Ok(())
}
