use std::collections::BTreeMap;
use std::sync::Arc;

use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::auth::GatewayAuth;
use crate::census::CensusAggregator;
use crate::member::{Health, Member, ServiceRumor};
use crate::membership_store::{MembershipStore, StoreSnapshot};
use crate::registry::{ServiceRegistry, ServiceStatus};
use crate::types::MemberId;

/// Everything the gateway reads from. Cloned into each connection.
#[derive(Clone)]
pub struct GatewayState {
    pub auth: GatewayAuth,
    pub store: MembershipStore,
    pub registry: Arc<ServiceRegistry>,
    pub census: CensusAggregator,
    pub member_id: MemberId,
}

pub async fn handle_connection(stream: TcpStream, state: Arc<GatewayState>) {
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { route_request(req, &state).await }
    });

    if let Err(e) = Http::new().serve_connection(stream, service).await {
        debug!("HTTP connection error: {}", e);
    }
}

#[derive(Debug, PartialEq)]
enum Route<'a> {
    Butterfly,
    Census,
    Services,
    Service { service: &'a str, group: &'a str },
    Health,
}

impl<'a> Route<'a> {
    fn parse(path: &'a str) -> Option<Self> {
        let path = path.strip_suffix('/').filter(|p| !p.is_empty()).unwrap_or(path);
        match path {
            "/butterfly" => Some(Route::Butterfly),
            "/census" => Some(Route::Census),
            "/services" => Some(Route::Services),
            "/health" => Some(Route::Health),
            _ => {
                let rest = path.strip_prefix("/services/")?;
                let (service, group) = rest.split_once('/')?;
                if service.is_empty() || group.is_empty() || group.contains('/') {
                    return None;
                }
                Some(Route::Service { service, group })
            }
        }
    }
}

pub async fn route_request(
    req: Request<Body>,
    state: &GatewayState,
) -> Result<Response<Body>, hyper::Error> {
    if let Err(e) = state.auth.check(req.headers()) {
        debug!("{} {} rejected: {}", req.method(), req.uri().path(), e);
        return Ok(empty(StatusCode::UNAUTHORIZED));
    }

    let Some(route) = Route::parse(req.uri().path()) else {
        return Ok(empty(StatusCode::NOT_FOUND));
    };
    if req.method() != Method::GET {
        let mut response = empty(StatusCode::METHOD_NOT_ALLOWED);
        response.headers_mut().insert(ALLOW, HeaderValue::from_static("GET"));
        return Ok(response);
    }

    let response = match route {
        Route::Butterfly => json(StatusCode::OK, &ButterflyView::from_snapshot(state.store.snapshot())),
        Route::Census => json(StatusCode::OK, &state.census.view()),
        Route::Services => json(StatusCode::OK, &state.registry.summaries()),
        Route::Service { service, group } => {
            if state.registry.status(service) == ServiceStatus::Unknown {
                return Ok(empty(StatusCode::NOT_FOUND));
            }
            let summary = state
                .registry
                .summaries()
                .into_iter()
                .find(|s| s.service_group.service() == service && s.service_group.group() == group);
            match summary {
                Some(summary) => json(StatusCode::OK, &summary),
                None => empty(StatusCode::NOT_FOUND),
            }
        }
        Route::Health => {
            let services: BTreeMap<String, ServiceStatus> = state
                .registry
                .loaded_specs()
                .values()
                .map(|spec| {
                    let name = spec.service_name();
                    (name.to_string(), state.registry.status(name))
                })
                .collect();
            json(
                StatusCode::OK,
                &HealthView {
                    version: env!("CARGO_PKG_VERSION"),
                    build: option_env!("GIT_COMMIT_HASH").unwrap_or("unknown"),
                    member_id: &state.member_id,
                    services,
                },
            )
        }
    };
    Ok(response)
}

fn empty(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn json<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Serialize)]
struct HealthView<'a> {
    version: &'static str,
    build: &'static str,
    member_id: &'a str,
    services: BTreeMap<String, ServiceStatus>,
}

#[derive(Serialize, Debug)]
pub struct ButterflyView {
    pub member: MemberSection,
    pub service: ServiceSection,
    pub departure: DepartureSection,
}

#[derive(Serialize, Debug)]
pub struct MemberSection {
    pub members: BTreeMap<MemberId, Member>,
    pub health: BTreeMap<MemberId, Health>,
    pub update_counter: u64,
}

#[derive(Serialize, Debug)]
pub struct ServiceSection {
    pub list: BTreeMap<String, BTreeMap<MemberId, ServiceRumor>>,
}

#[derive(Serialize, Debug)]
pub struct DepartureSection {
    pub list: Vec<MemberId>,
}

impl ButterflyView {
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let departed = snapshot
            .members
            .iter()
            .filter(|m| m.health == Health::Departed)
            .map(|m| m.id.clone())
            .collect();
        let health = snapshot
            .members
            .iter()
            .map(|m| (m.id.clone(), m.health))
            .collect();
        let mut list: BTreeMap<String, BTreeMap<MemberId, ServiceRumor>> = BTreeMap::new();
        for rumor in snapshot.services {
            list.entry(rumor.service_group.to_string())
                .or_default()
                .insert(rumor.member_id.clone(), rumor);
        }
        Self {
            member: MemberSection {
                members: snapshot.members.into_iter().map(|m| (m.id.clone(), m)).collect(),
                health,
                update_counter: snapshot.update_counter,
            },
            service: ServiceSection { list },
            departure: DepartureSection { list: departed },
        }
    }
}
