//! Registry API
//!
//! Request/response surface consumed by the gateway layer. Every handler
//! returns a structured `ActuatorResponse`; the embedded `ResultCode` is
//! authoritative and no handler ever fails at the transport level.

use crate::actuator::{ActuatorMetadata, ActuatorName, ActuatorPatch, ActuatorRecord, Address};
use crate::error::{ErrorKind, RegistryError, RegistryResult};
use crate::membership::MembershipManager;
use crate::query::QueryService;
use actuary_core::metrics::record_registry_operation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Result codes carried in every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Success,
    ErrCreateActuatFail,
    ErrDeleteActuatFail,
    ErrChangeActuatFail,
    ErrGetActuatFail,
    ErrGetExecutorIpFail,
    ErrKeepaliveActuatFail,
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::ErrCreateActuatFail => "ERR_CREATE_ACTUAT_FAIL",
            Self::ErrDeleteActuatFail => "ERR_DELETE_ACTUAT_FAIL",
            Self::ErrChangeActuatFail => "ERR_CHANGE_ACTUAT_FAIL",
            Self::ErrGetActuatFail => "ERR_GET_ACTUAT_FAIL",
            Self::ErrGetExecutorIpFail => "ERR_GET_EXECUTOR_IP_FAIL",
            Self::ErrKeepaliveActuatFail => "ERR_KEEPALIVE_ACTUAT_FAIL",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateActuatorRequest {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: ActuatorMetadata,
    /// Call budget; the configured default when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteActuatorRequest {
    pub name: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeActuatorRequest {
    pub name: String,
    pub patch: ActuatorPatch,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Empty `name` lists every actuator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetActuatorRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveActuatorRequest {
    pub name: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

// =============================================================================
// Response
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorResponse {
    pub code: ResultCode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actuators: Vec<ActuatorRecord>,
    /// `host:port` of every Healthy actuator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executor_ips: Vec<String>,
    /// Served from a snapshot that may lag the coordination store
    #[serde(default)]
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActuatorResponse {
    pub fn success() -> Self {
        Self {
            code: ResultCode::Success,
            actuators: Vec::new(),
            executor_ips: Vec::new(),
            stale: false,
            error_kind: None,
            error: None,
        }
    }

    fn with_actuators(actuators: Vec<ActuatorRecord>) -> Self {
        Self {
            actuators,
            ..Self::success()
        }
    }

    pub fn failure(code: ResultCode, err: &RegistryError) -> Self {
        debug_assert!(!code.is_success());
        Self {
            code,
            error_kind: Some(err.kind()),
            error: Some(err.to_string()),
            ..Self::success()
        }
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

// =============================================================================
// Service Trait
// =============================================================================

/// Registry RPC surface
#[async_trait]
pub trait ActuatorService: Send + Sync {
    async fn create_actuator(&self, request: CreateActuatorRequest) -> ActuatorResponse;

    async fn delete_actuator(&self, request: DeleteActuatorRequest) -> ActuatorResponse;

    async fn change_actuator(&self, request: ChangeActuatorRequest) -> ActuatorResponse;

    async fn get_actuator(&self, request: GetActuatorRequest) -> ActuatorResponse;

    async fn get_all_executor_ip(&self) -> ActuatorResponse;

    async fn keep_alive_actuator(&self, request: KeepAliveActuatorRequest) -> ActuatorResponse;
}

/// `ActuatorService` over the Membership Manager and Query Service
#[derive(Debug, Clone)]
pub struct RegistryApi {
    membership: Arc<MembershipManager>,
    query: QueryService,
}

impl RegistryApi {
    pub fn new(membership: Arc<MembershipManager>, query: QueryService) -> Self {
        Self { membership, query }
    }

    fn finish(
        operation: &'static str,
        fail: ResultCode,
        start: Instant,
        result: RegistryResult<ActuatorResponse>,
    ) -> ActuatorResponse {
        let elapsed = start.elapsed().as_secs_f64();
        match result {
            Ok(response) => {
                record_registry_operation(operation, ResultCode::Success.as_str(), elapsed);
                response
            }
            Err(e) => {
                error!(operation, kind = ?e.kind(), error = %e, "Registry call failed");
                record_registry_operation(operation, fail.as_str(), elapsed);
                ActuatorResponse::failure(fail, &e)
            }
        }
    }
}

fn timeout(ms: Option<u64>) -> Option<Duration> {
    ms.map(Duration::from_millis)
}

#[async_trait]
impl ActuatorService for RegistryApi {
    async fn create_actuator(&self, request: CreateActuatorRequest) -> ActuatorResponse {
        debug!(name = %request.name, "CreateActuator");
        let start = Instant::now();
        let result = async {
            let name = ActuatorName::new(request.name)?;
            let address = Address::new(request.host, request.port)?;
            let record = self
                .membership
                .create(name, address, request.metadata, timeout(request.timeout_ms))
                .await?;
            Ok::<_, RegistryError>(ActuatorResponse::with_actuators(vec![record]))
        }
        .await;
        Self::finish("create", ResultCode::ErrCreateActuatFail, start, result)
    }

    async fn delete_actuator(&self, request: DeleteActuatorRequest) -> ActuatorResponse {
        debug!(name = %request.name, "DeleteActuator");
        let start = Instant::now();
        let result = async {
            let name = ActuatorName::new(request.name)?;
            self.membership
                .delete(&name, timeout(request.timeout_ms))
                .await?;
            Ok::<_, RegistryError>(ActuatorResponse::success())
        }
        .await;
        Self::finish("delete", ResultCode::ErrDeleteActuatFail, start, result)
    }

    async fn change_actuator(&self, request: ChangeActuatorRequest) -> ActuatorResponse {
        debug!(name = %request.name, version = %request.patch.version, "ChangeActuator");
        let start = Instant::now();
        let result = async {
            let name = ActuatorName::new(request.name)?;
            let record = self
                .membership
                .change(&name, request.patch, timeout(request.timeout_ms))
                .await?;
            Ok::<_, RegistryError>(ActuatorResponse::with_actuators(vec![record]))
        }
        .await;
        Self::finish("change", ResultCode::ErrChangeActuatFail, start, result)
    }

    async fn get_actuator(&self, request: GetActuatorRequest) -> ActuatorResponse {
        debug!(name = %request.name, "GetActuator");
        let start = Instant::now();
        let result = if request.name.is_empty() {
            let observed = self.query.list();
            Ok(ActuatorResponse {
                stale: observed.stale,
                ..ActuatorResponse::with_actuators(observed.value)
            })
        } else {
            ActuatorName::new(request.name)
                .and_then(|name| self.query.get(&name))
                .map(|observed| ActuatorResponse {
                    stale: observed.stale,
                    ..ActuatorResponse::with_actuators(vec![observed.value])
                })
        };
        Self::finish("get", ResultCode::ErrGetActuatFail, start, result)
    }

    async fn get_all_executor_ip(&self) -> ActuatorResponse {
        debug!("GetAllExecutorIP");
        let start = Instant::now();
        let observed = self
            .query
            .list_healthy_addresses()
            .map(|addresses| addresses.iter().map(Address::to_string).collect::<Vec<_>>());
        let response = ActuatorResponse {
            executor_ips: observed.value,
            stale: observed.stale,
            ..ActuatorResponse::success()
        };
        Self::finish(
            "get_all_executor_ip",
            ResultCode::ErrGetExecutorIpFail,
            start,
            Ok(response),
        )
    }

    async fn keep_alive_actuator(&self, request: KeepAliveActuatorRequest) -> ActuatorResponse {
        debug!(name = %request.name, "KeepAliveActuator");
        let start = Instant::now();
        let result = async {
            let name = ActuatorName::new(request.name)?;
            let record = self
                .membership
                .heartbeat(&name, timeout(request.timeout_ms))
                .await?;
            Ok::<_, RegistryError>(ActuatorResponse::with_actuators(vec![record]))
        }
        .await;
        Self::finish("keep_alive", ResultCode::ErrKeepaliveActuatFail, start, result)
    }
}
