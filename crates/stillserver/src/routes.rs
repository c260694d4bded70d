use actix_web::{get, post, web, HttpRequest, HttpResponse, Responder, Result as ActixResult};
use actix_ws::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stillcore::{
    FlowDefinition, FlowError, FlowId, NodeError, RunId, RunStatus, StoreError, Value,
    WorkflowError, DEFAULT_TENANT,
};
use stillruntime::{FlowRuntime, ResumeOutcome};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// Application state shared across handlers
pub struct AppState {
    pub runtime: Arc<FlowRuntime>,
}

/// Request body for starting a run
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StartRunRequest {
    input: serde_json::Value,
    tenant_id: Option<String>,
}

/// Response for flow registration
#[derive(Debug, Serialize)]
struct FlowResponse {
    id: FlowId,
    message: String,
}

/// Response for run creation and stop
#[derive(Debug, Serialize)]
struct RunResponse {
    run_id: RunId,
    status: RunStatus,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Map engine errors onto HTTP statuses.
fn error_response(e: &FlowError) -> HttpResponse {
    let body = ErrorResponse {
        error: e.to_string(),
    };
    match e {
        FlowError::RunNotFound(_)
        | FlowError::CorrelationNotFound(_)
        | FlowError::Workflow(WorkflowError::NotFound(_)) => HttpResponse::NotFound().json(body),
        FlowError::Workflow(_) | FlowError::Node(NodeError::Configuration(_)) => {
            HttpResponse::BadRequest().json(body)
        }
        FlowError::IllegalState(_) => HttpResponse::Conflict().json(body),
        FlowError::Store(StoreError::Unavailable(_)) => HttpResponse::ServiceUnavailable().json(body),
        _ => {
            error!("Request failed: {}", e);
            HttpResponse::InternalServerError().json(body)
        }
    }
}

/// Bodies are JSON when they parse, raw bytes otherwise, null when empty.
fn payload_from_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(json) => Value::from_json(json),
        Err(_) => Value::Bytes(body.to_vec()),
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check(data: web::Data<AppState>) -> impl Responder {
    let runtime = &data.runtime;
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "stillflow",
        "timer_queue": runtime.scheduler().queue().name(),
        "transport": runtime.correlator().transport().name(),
    }))
}

/// List registered flows
#[get("/api/flows")]
async fn list_flows(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let flows = match data.runtime.orchestrator().list_flows().await {
        Ok(flows) => flows,
        Err(e) => return Ok(error_response(&e)),
    };
    let flow_list: Vec<_> = flows
        .iter()
        .map(|flow| {
            serde_json::json!({
                "id": flow.id,
                "name": flow.name,
                "description": flow.description,
                "node_count": flow.nodes.len(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(flow_list))
}

/// Validate and register a flow
#[post("/api/flows")]
async fn create_flow(
    data: web::Data<AppState>,
    flow: web::Json<FlowDefinition>,
) -> ActixResult<impl Responder> {
    let flow = flow.into_inner();
    match data.runtime.orchestrator().register_flow(flow).await {
        Ok(flow) => {
            info!("Registered flow {} ({})", flow.name, flow.id);
            Ok(HttpResponse::Created().json(FlowResponse {
                id: flow.id,
                message: format!("Flow '{}' registered", flow.name),
            }))
        }
        Err(e) => Ok(error_response(&e)),
    }
}

#[get("/api/flows/{id}")]
async fn get_flow(data: web::Data<AppState>, path: web::Path<FlowId>) -> ActixResult<impl Responder> {
    match data.runtime.orchestrator().flow(path.into_inner()).await {
        Ok(flow) => Ok(HttpResponse::Ok().json(flow.as_ref())),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Start a run; responds once the run has completed, failed or started waiting.
#[post("/api/flows/{id}/runs")]
async fn start_run(
    data: web::Data<AppState>,
    path: web::Path<FlowId>,
    req: Option<web::Json<StartRunRequest>>,
) -> ActixResult<impl Responder> {
    let flow_id = path.into_inner();
    let req = req.map(web::Json::into_inner).unwrap_or_default();
    let tenant_id = req.tenant_id.as_deref().unwrap_or(DEFAULT_TENANT);

    info!("Starting run of flow {} for tenant {}", flow_id, tenant_id);

    let orchestrator = data.runtime.orchestrator();
    let run = match orchestrator
        .start_stored_run(tenant_id, flow_id, Value::from_json(req.input))
        .await
    {
        Ok(run_id) => orchestrator.get_run(run_id).await,
        Err(e) => Err(e),
    };
    match run {
        Ok(run) => Ok(HttpResponse::Created().json(RunResponse {
            run_id: run.run_id,
            status: run.status,
        })),
        Err(e) => Ok(error_response(&e)),
    }
}

#[get("/api/runs")]
async fn list_runs(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    match data.runtime.orchestrator().list_runs().await {
        Ok(runs) => {
            let runs: Vec<_> = runs
                .iter()
                .map(|run| {
                    serde_json::json!({
                        "run_id": run.run_id,
                        "flow_id": run.flow_id,
                        "tenant_id": run.tenant_id,
                        "status": run.status,
                        "updated_at": run.updated_at,
                    })
                })
                .collect();
            Ok(HttpResponse::Ok().json(runs))
        }
        Err(e) => Ok(error_response(&e)),
    }
}

#[get("/api/runs/{id}")]
async fn get_run(data: web::Data<AppState>, path: web::Path<RunId>) -> ActixResult<impl Responder> {
    match data.runtime.get_run(path.into_inner()).await {
        Ok(run) => Ok(HttpResponse::Ok().json(run)),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Waiting registrations a run is blocked on
#[get("/api/runs/{id}/waits")]
async fn run_waits(data: web::Data<AppState>, path: web::Path<RunId>) -> ActixResult<impl Responder> {
    match data.runtime.orchestrator().waiting_on(path.into_inner()).await {
        Ok(waits) => Ok(HttpResponse::Ok().json(waits)),
        Err(e) => Ok(error_response(&e)),
    }
}

#[post("/api/runs/{id}/stop")]
async fn stop_run(data: web::Data<AppState>, path: web::Path<RunId>) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    match data.runtime.stop(run_id).await {
        Ok(status) => Ok(HttpResponse::Ok().json(RunResponse { run_id, status })),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Resume a suspended node directly by correlation id
#[post("/api/resume/{correlation_id}")]
async fn resume(
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Bytes,
) -> ActixResult<impl Responder> {
    let correlation_id = path.into_inner();
    match data.runtime.resume(&correlation_id, payload_from_body(&body)).await {
        Ok(ResumeOutcome::NotFound) => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: FlowError::CorrelationNotFound(correlation_id).to_string(),
        })),
        Ok(outcome @ ResumeOutcome::Rejected { .. }) => Ok(HttpResponse::Conflict().json(outcome)),
        Ok(outcome) => Ok(HttpResponse::Ok().json(outcome)),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Publish an event on a channel; waiters are resumed by the transport listener.
#[post("/api/channels/{key}/publish")]
async fn publish(
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Bytes,
) -> ActixResult<impl Responder> {
    let channel = path.into_inner();
    match data.runtime.publish(&channel, payload_from_body(&body)).await {
        Ok(()) => Ok(HttpResponse::Accepted().json(serde_json::json!({ "channel": channel }))),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Inbound webhook call: resumes every wait registered on the path.
#[post("/webhook/{path:.*}")]
async fn webhook(
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Bytes,
) -> ActixResult<impl Responder> {
    let path = path.into_inner();
    let delivery = data.runtime.deliver_webhook(&path, payload_from_body(&body)).await;
    if delivery.matched() == 0 {
        warn!("Webhook call on '{}' matched no waiting node", path);
    }
    Ok(HttpResponse::Ok().json(delivery))
}

/// WebSocket endpoint for real-time events
#[get("/api/events")]
async fn websocket_events(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");

    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("WebSocket client lagged, {} events dropped", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// List available node types
#[get("/api/nodes")]
async fn list_node_types(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let registry = data.runtime.registry();
    let nodes: Vec<_> = registry
        .list_node_types()
        .iter()
        .map(|node_type| {
            let metadata = registry.get_metadata(node_type).unwrap_or_default();
            serde_json::json!({
                "type": node_type,
                "description": metadata.description,
                "category": metadata.category,
                "handles": metadata.handles,
                "suspends": metadata.suspends,
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(nodes))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_flows)
        .service(create_flow)
        .service(get_flow)
        .service(start_run)
        .service(list_runs)
        .service(get_run)
        .service(run_waits)
        .service(stop_run)
        .service(resume)
        .service(publish)
        .service(webhook)
        .service(websocket_events)
        .service(list_node_types);
}
