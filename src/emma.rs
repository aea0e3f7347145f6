//! Client for the emma cloud REST API.
//!
//! This is the single point of contact with the provider. It owns the
//! bearer-token lifecycle (issue, early refresh, re-authentication),
//! the conflict-retry policy for VM attach/detach actions and the
//! status-polling helpers the controller service builds its state
//! transitions on. Every method is cancel-safe: dropping the returned
//! future aborts the operation without leaving client-side state
//! behind.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::metrics;

/// Default provider endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.emma.ms/external";

/// A token is refreshed once less than this much lifetime remains.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Cadence of the status-polling helpers.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Maximum retries for attach/detach conflicts (409).
const VM_CONFLICT_RETRIES: usize = 12;

/// Maximum retries for transient 400 responses on VM actions.
const BAD_REQUEST_RETRIES: usize = 3;

/// Delay between transient 400 retries.
const BAD_REQUEST_DELAY: Duration = Duration::from_secs(2);

/// Wall-clock budget for outbound HTTP requests.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised by the provider client.
#[derive(Debug, Error)]
pub enum EmmaError {
    /// The provider rejected the request as malformed (422).
    #[error("invalid request: {0}")]
    InvalidArgument(String),
    /// Both the refresh grant and a credentials re-issue failed, or the
    /// provider kept answering 401.
    #[error("authentication with the provider failed: {0}")]
    Unauthenticated(String),
    /// The credentials are valid but not allowed to act (403).
    #[error("provider denied access: {0}")]
    PermissionDenied(String),
    /// The referenced entity does not exist (404).
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind, e.g. `volume` or `data center`.
        kind: &'static str,
        /// Provider identifier that was looked up.
        id: String,
    },
    /// The entity is in a state that forbids the operation (409) and
    /// the retry budget is exhausted.
    #[error("conflicting state for {kind} {id}: {message}")]
    Conflict {
        /// Entity kind.
        kind: &'static str,
        /// Provider identifier.
        id: String,
        /// Body returned by the provider.
        message: String,
    },
    /// The volume entered the terminal FAILED state while being waited on.
    #[error("volume {volume_id} entered FAILED state")]
    VolumeFailed {
        /// Volume that failed.
        volume_id: i64,
    },
    /// A polling helper ran out of its wall-clock budget.
    #[error("timeout waiting for {action} of volume {volume_id}")]
    Timeout {
        /// Action being waited on.
        action: &'static str,
        /// Volume being waited on.
        volume_id: i64,
    },
    /// Any other non-2xx response.
    #[error("provider returned status {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, if any.
        body: String,
    },
    /// Network-level failure.
    #[error("request to the provider failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Lifecycle states the provider reports for a volume.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeStatus {
    Draft,
    Busy,
    Available,
    Active,
    Failed,
    Deleted,
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Draft => "DRAFT",
            Self::Busy => "BUSY",
            Self::Available => "AVAILABLE",
            Self::Active => "ACTIVE",
            Self::Failed => "FAILED",
            Self::Deleted => "DELETED",
        })
    }
}

/// A block volume as reported by the provider.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: i64,
    pub name: String,
    pub size_gb: i64,
    #[serde(rename = "type")]
    pub volume_type: String,
    pub status: VolumeStatus,
    #[serde(default)]
    pub attached_to_id: Option<i64>,
    #[serde(default)]
    pub data_center_id: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// A worker virtual machine. Only the fields the driver reads are
/// modelled.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub volumes: Vec<VmVolume>,
}

/// Reference to a volume attached to a VM.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmVolume {
    pub id: i64,
}

/// A managed Kubernetes cluster: cluster -> node groups -> nodes.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesCluster {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub node_groups: Vec<NodeGroup>,
}

/// A homogeneous group of worker nodes inside a cluster.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<ClusterNode>,
}

/// A single worker node: the orchestrator-visible name plus the
/// provider VM id backing it.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub id: i64,
    pub name: String,
}

/// A data centre the provider can place volumes in.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataCenter {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub location_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Credentials<'a> {
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VolumeCreateRequest<'a> {
    name: &'a str,
    volume_gb: i64,
    volume_type: &'a str,
    data_center_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VolumeEditRequest {
    action: &'static str,
    size_gb: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VmActionRequest {
    action: &'static str,
    volume_id: i64,
}

/// Bearer-token state shared by every request in the process.
#[derive(Debug)]
struct TokenState {
    access_token: String,
    refresh_token: String,
    expires_at: Instant,
}

/// Client for the provider REST API.
///
/// Construction exchanges the client credentials for a token; the
/// token is kept behind a readers-writer lock so concurrent requests
/// share it and at most one of them runs a refresh.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    token: RwLock<TokenState>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect to the provider and authenticate.
    pub async fn connect(
        base_url: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Self, EmmaError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let base_url = base_url.trim_end_matches('/').to_owned();
        let token = issue_token(&http, &base_url, client_id, client_secret).await?;
        info!(%base_url, "provider API client initialised");
        Ok(Self {
            http,
            base_url,
            client_id: client_id.to_owned(),
            client_secret: client_secret.to_owned(),
            token: RwLock::new(token),
        })
    }

    /// Return a valid access token, refreshing it when less than the
    /// margin remains. Readers share the fast path; a refresh takes the
    /// write guard and re-checks expiry after acquiring it so that a
    /// burst of expired requests results in exactly one refresh call.
    async fn access_token(&self) -> Result<String, EmmaError> {
        {
            let token = self.token.read().await;
            if Instant::now() + TOKEN_REFRESH_MARGIN < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        let mut token = self.token.write().await;
        // Another request may have refreshed while this one waited for
        // the write guard.
        if Instant::now() + TOKEN_REFRESH_MARGIN < token.expires_at {
            return Ok(token.access_token.clone());
        }

        info!("access token expired or expiring soon, refreshing");
        match refresh_token(&self.http, &self.base_url, &token.refresh_token).await {
            Ok(fresh) => {
                *token = fresh;
                info!("access token refreshed");
                return Ok(token.access_token.clone());
            }
            Err(err) => {
                warn!(error = %err, "token refresh failed, re-authenticating");
            }
        }

        match issue_token(&self.http, &self.base_url, &self.client_id, &self.client_secret).await {
            Ok(fresh) => {
                *token = fresh;
                info!("re-authenticated with client credentials");
                Ok(token.access_token.clone())
            }
            Err(err) => Err(EmmaError::Unauthenticated(err.to_string())),
        }
    }

    /// Drop the cached token and fetch a new one. Used after an
    /// unexpected 401 on a request that should have carried a valid
    /// token.
    async fn force_refresh(&self) -> Result<(), EmmaError> {
        let mut token = self.token.write().await;
        match refresh_token(&self.http, &self.base_url, &token.refresh_token).await {
            Ok(fresh) => {
                *token = fresh;
                Ok(())
            }
            Err(refresh_err) => {
                warn!(error = %refresh_err, "forced token refresh failed, re-authenticating");
                match issue_token(
                    &self.http,
                    &self.base_url,
                    &self.client_id,
                    &self.client_secret,
                )
                .await
                {
                    Ok(fresh) => {
                        *token = fresh;
                        Ok(())
                    }
                    Err(err) => Err(EmmaError::Unauthenticated(err.to_string())),
                }
            }
        }
    }

    /// Execute one authenticated request. `endpoint` is the fixed path
    /// template used as the metric label so identifiers do not blow up
    /// the label cardinality.
    async fn request<B>(
        &self,
        method: Method,
        path: &str,
        endpoint: &'static str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, EmmaError>
    where
        B: Serialize + ?Sized,
    {
        let token = self.access_token().await?;

        let mut builder = self
            .http
            .request(method.clone(), format!("{}{}", self.base_url, path))
            .bearer_auth(token);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        debug!(%method, path, "provider API request");
        let started = Instant::now();
        let result = builder.send().await;
        let status = result.as_ref().map(|r| r.status().as_u16()).unwrap_or(0);
        metrics::observe_api_request(method.as_str(), endpoint, status, started.elapsed());

        let response = result?;
        debug!(%method, path, status, "provider API response");
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(%method, path, "provider returned 401, token may have expired");
        }
        Ok(response)
    }

    /// Create a volume. The provider returns it in `DRAFT` or
    /// `AVAILABLE`; callers poll for `AVAILABLE` before use.
    pub async fn create_volume(
        &self,
        name: &str,
        size_gb: i64,
        volume_type: &str,
        data_center_id: &str,
    ) -> Result<Volume, EmmaError> {
        debug!(name, size_gb, volume_type, data_center_id, "creating volume");
        let body = VolumeCreateRequest {
            name,
            volume_gb: size_gb,
            volume_type,
            data_center_id,
        };
        let response = self
            .request(Method::POST, "/v1/volumes", "/v1/volumes", Some(&body))
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let volume: Volume = response.json().await?;
                debug!(volume_id = volume.id, status = ?volume.status, "volume created");
                Ok(volume)
            }
            _ => Err(api_error(response).await),
        }
    }

    /// Fetch a single volume.
    pub async fn get_volume(&self, volume_id: i64) -> Result<Volume, EmmaError> {
        let response = self
            .request::<()>(
                Method::GET,
                &format!("/v1/volumes/{volume_id}"),
                "/v1/volumes/{id}",
                None,
            )
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(EmmaError::NotFound {
                kind: "volume",
                id: volume_id.to_string(),
            }),
            _ => Err(api_error(response).await),
        }
    }

    /// List every volume in the account.
    pub async fn list_volumes(&self) -> Result<Vec<Volume>, EmmaError> {
        let response = self
            .request::<()>(Method::GET, "/v1/volumes", "/v1/volumes", None)
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            _ => Err(api_error(response).await),
        }
    }

    /// Delete a volume. A 404 means it is already gone and counts as
    /// success.
    pub async fn delete_volume(&self, volume_id: i64) -> Result<(), EmmaError> {
        debug!(volume_id, "deleting volume");
        let response = self
            .request::<()>(
                Method::DELETE,
                &format!("/v1/volumes/{volume_id}"),
                "/v1/volumes/{id}",
                None,
            )
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(volume_id, "volume not found, treating delete as success");
                Ok(())
            }
            StatusCode::CONFLICT => Err(EmmaError::Conflict {
                kind: "volume",
                id: volume_id.to_string(),
                message: read_body(response).await,
            }),
            _ => Err(api_error(response).await),
        }
    }

    /// Request a volume resize. The provider applies it asynchronously;
    /// callers poll the volume status afterwards.
    pub async fn resize_volume(&self, volume_id: i64, new_size_gb: i64) -> Result<(), EmmaError> {
        debug!(volume_id, new_size_gb, "resizing volume");
        let body = VolumeEditRequest {
            action: "edit",
            size_gb: new_size_gb,
        };
        let response = self
            .request(
                Method::POST,
                &format!("/v1/volumes/{volume_id}/actions"),
                "/v1/volumes/{id}/actions",
                Some(&body),
            )
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(()),
            _ => Err(api_error(response).await),
        }
    }

    /// Attach a volume to a VM, retrying through transitional VM
    /// states.
    pub async fn attach_volume(&self, vm_id: i64, volume_id: i64) -> Result<(), EmmaError> {
        debug!(vm_id, volume_id, "attaching volume");
        self.vm_action("attach", vm_id, volume_id).await
    }

    /// Detach a volume from a VM, retrying through transitional VM
    /// states.
    pub async fn detach_volume(&self, vm_id: i64, volume_id: i64) -> Result<(), EmmaError> {
        debug!(vm_id, volume_id, "detaching volume");
        self.vm_action("detach", vm_id, volume_id).await
    }

    /// Issue a VM action and absorb the provider's transitional
    /// failures: 409 while the VM is busy (retried on the conflict
    /// schedule), transient 400s (up to three retries at a fixed two
    /// seconds) and a stale token on the first attempt (one forced
    /// refresh).
    async fn vm_action(
        &self,
        action: &'static str,
        vm_id: i64,
        volume_id: i64,
    ) -> Result<(), EmmaError> {
        let path = format!("/v1/vms/{vm_id}/actions");
        let body = VmActionRequest { action, volume_id };
        let started = Instant::now();
        let mut bad_request_retries = 0;

        for attempt in 0..=VM_CONFLICT_RETRIES {
            let response = self
                .request(Method::POST, &path, "/v1/vms/{id}/actions", Some(&body))
                .await?;
            let status = response.status();

            if status == StatusCode::OK || status == StatusCode::ACCEPTED {
                debug!(
                    action,
                    vm_id,
                    volume_id,
                    attempts = attempt + 1,
                    elapsed = ?started.elapsed(),
                    "VM action accepted"
                );
                return Ok(());
            }

            let text = read_body(response).await;

            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                debug!(action, vm_id, "401 on first attempt, forcing token refresh");
                self.force_refresh().await?;
                continue;
            }

            if status == StatusCode::CONFLICT && attempt < VM_CONFLICT_RETRIES {
                let delay = conflict_backoff(attempt);
                debug!(
                    action,
                    vm_id,
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs(),
                    body = %text,
                    "VM in transitional state, retrying"
                );
                sleep(delay).await;
                continue;
            }

            if status == StatusCode::BAD_REQUEST && bad_request_retries < BAD_REQUEST_RETRIES {
                bad_request_retries += 1;
                debug!(
                    action,
                    vm_id,
                    retry = bad_request_retries,
                    body = %text,
                    "transient bad request, retrying"
                );
                sleep(BAD_REQUEST_DELAY).await;
                continue;
            }

            return Err(status_error(status, text, "vm", vm_id.to_string()));
        }

        Err(EmmaError::Conflict {
            kind: "vm",
            id: vm_id.to_string(),
            message: format!("not ready after {} attempts", VM_CONFLICT_RETRIES + 1),
        })
    }

    /// Fetch a single VM.
    pub async fn get_vm(&self, vm_id: i64) -> Result<Vm, EmmaError> {
        let response = self
            .request::<()>(
                Method::GET,
                &format!("/v1/vms/{vm_id}"),
                "/v1/vms/{id}",
                None,
            )
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(EmmaError::NotFound {
                kind: "vm",
                id: vm_id.to_string(),
            }),
            _ => Err(api_error(response).await),
        }
    }

    /// List every VM in the account.
    pub async fn list_vms(&self) -> Result<Vec<Vm>, EmmaError> {
        let response = self
            .request::<()>(Method::GET, "/v1/vms", "/v1/vms", None)
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            _ => Err(api_error(response).await),
        }
    }

    /// List managed Kubernetes clusters with their node groups.
    pub async fn list_kubernetes_clusters(&self) -> Result<Vec<KubernetesCluster>, EmmaError> {
        let response = self
            .request::<()>(Method::GET, "/v1/kubernetes", "/v1/kubernetes", None)
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            _ => Err(api_error(response).await),
        }
    }

    /// Fetch a single Kubernetes cluster.
    pub async fn get_kubernetes_cluster(
        &self,
        cluster_id: i64,
    ) -> Result<KubernetesCluster, EmmaError> {
        let response = self
            .request::<()>(
                Method::GET,
                &format!("/v1/kubernetes/{cluster_id}"),
                "/v1/kubernetes/{id}",
                None,
            )
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(EmmaError::NotFound {
                kind: "kubernetes cluster",
                id: cluster_id.to_string(),
            }),
            _ => Err(api_error(response).await),
        }
    }

    /// List available data centres.
    pub async fn get_data_centers(&self) -> Result<Vec<DataCenter>, EmmaError> {
        let response = self
            .request::<()>(Method::GET, "/v1/data-centers", "/v1/data-centers", None)
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            _ => Err(api_error(response).await),
        }
    }

    /// Fetch a single data centre.
    pub async fn get_data_center(&self, data_center_id: &str) -> Result<DataCenter, EmmaError> {
        let response = self
            .request::<()>(
                Method::GET,
                &format!("/v1/data-centers/{data_center_id}"),
                "/v1/data-centers/{id}",
                None,
            )
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(EmmaError::NotFound {
                kind: "data center",
                id: data_center_id.to_owned(),
            }),
            _ => Err(api_error(response).await),
        }
    }

    /// Check that a data centre exists.
    pub async fn validate_data_center(&self, data_center_id: &str) -> Result<(), EmmaError> {
        self.get_data_center(data_center_id).await.map(|_| ())
    }

    /// Poll until the volume reaches `desired`, it fails, or the
    /// budget runs out. Returns the final volume record.
    pub async fn wait_for_volume_status(
        &self,
        volume_id: i64,
        desired: VolumeStatus,
        timeout: Duration,
    ) -> Result<Volume, EmmaError> {
        debug!(volume_id, ?desired, ?timeout, "waiting for volume status");
        let deadline = Instant::now() + timeout;
        loop {
            let volume = self.get_volume(volume_id).await?;
            if volume.status == desired {
                debug!(volume_id, ?desired, "volume reached desired status");
                return Ok(volume);
            }
            if volume.status == VolumeStatus::Failed {
                return Err(EmmaError::VolumeFailed { volume_id });
            }
            if Instant::now() + POLL_INTERVAL > deadline {
                return Err(EmmaError::Timeout {
                    action: "status change",
                    volume_id,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll until the volume is `ACTIVE` and attached to `vm_id`.
    pub async fn wait_for_volume_attachment(
        &self,
        volume_id: i64,
        vm_id: i64,
        timeout: Duration,
    ) -> Result<(), EmmaError> {
        debug!(volume_id, vm_id, ?timeout, "waiting for volume attachment");
        let deadline = Instant::now() + timeout;
        loop {
            let volume = self.get_volume(volume_id).await?;
            if volume.status == VolumeStatus::Active && volume.attached_to_id == Some(vm_id) {
                debug!(volume_id, vm_id, "volume attached");
                return Ok(());
            }
            if volume.status == VolumeStatus::Failed {
                return Err(EmmaError::VolumeFailed { volume_id });
            }
            if Instant::now() + POLL_INTERVAL > deadline {
                return Err(EmmaError::Timeout {
                    action: "attachment",
                    volume_id,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll until the volume is `AVAILABLE` with no attachment.
    pub async fn wait_for_volume_detachment(
        &self,
        volume_id: i64,
        timeout: Duration,
    ) -> Result<(), EmmaError> {
        debug!(volume_id, ?timeout, "waiting for volume detachment");
        let deadline = Instant::now() + timeout;
        loop {
            let volume = self.get_volume(volume_id).await?;
            if volume.status == VolumeStatus::Available && volume.attached_to_id.is_none() {
                debug!(volume_id, "volume detached");
                return Ok(());
            }
            if volume.status == VolumeStatus::Failed {
                return Err(EmmaError::VolumeFailed { volume_id });
            }
            if Instant::now() + POLL_INTERVAL > deadline {
                return Err(EmmaError::Timeout {
                    action: "detachment",
                    volume_id,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

async fn issue_token(
    http: &reqwest::Client,
    base_url: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<TokenState, EmmaError> {
    let response = http
        .post(format!("{base_url}/v1/issue-token"))
        .json(&Credentials {
            client_id,
            client_secret,
        })
        .send()
        .await?;
    token_state(response).await
}

async fn refresh_token(
    http: &reqwest::Client,
    base_url: &str,
    refresh_token: &str,
) -> Result<TokenState, EmmaError> {
    let response = http
        .post(format!("{base_url}/v1/refresh-token"))
        .json(&RefreshGrant { refresh_token })
        .send()
        .await?;
    token_state(response).await
}

async fn token_state(response: reqwest::Response) -> Result<TokenState, EmmaError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(EmmaError::Unauthenticated(format!(
            "token endpoint returned status {status}: {body}"
        )));
    }
    let token: TokenResponse = response.json().await?;
    Ok(TokenState {
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        expires_at: Instant::now() + Duration::from_secs(token.expires_in),
    })
}

async fn read_body(response: reqwest::Response) -> String {
    response.text().await.unwrap_or_default()
}

/// Map a terminal non-2xx response to the error taxonomy.
async fn api_error(response: reqwest::Response) -> EmmaError {
    let status = response.status();
    let body = read_body(response).await;
    match status {
        StatusCode::UNAUTHORIZED => EmmaError::Unauthenticated(body),
        StatusCode::FORBIDDEN => EmmaError::PermissionDenied(body),
        StatusCode::UNPROCESSABLE_ENTITY => EmmaError::InvalidArgument(body),
        _ => EmmaError::Api {
            status: status.as_u16(),
            body,
        },
    }
}

fn status_error(status: StatusCode, body: String, kind: &'static str, id: String) -> EmmaError {
    match status {
        StatusCode::UNAUTHORIZED => EmmaError::Unauthenticated(body),
        StatusCode::FORBIDDEN => EmmaError::PermissionDenied(body),
        StatusCode::UNPROCESSABLE_ENTITY => EmmaError::InvalidArgument(body),
        StatusCode::CONFLICT => EmmaError::Conflict { kind, id, message: body },
        _ => EmmaError::Api {
            status: status.as_u16(),
            body,
        },
    }
}

/// Backoff for VM-transition conflicts: 1, 2, 3, 5, 8, 12 and then
/// capped at 15 seconds.
fn conflict_backoff(attempt: usize) -> Duration {
    let secs = match attempt {
        0 => 1,
        1 => 2,
        2 => 3,
        3 => 5,
        4 => 8,
        5 => 12,
        _ => 15,
    };
    Duration::from_secs(secs)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use serde_json::json;

    /// Scripted provider double. Requests pop the front of the
    /// per-endpoint script; an empty script yields the fallback.
    #[derive(Default)]
    struct Fake {
        issue_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
        vm_action_calls: AtomicUsize,
        vm_action_script: Mutex<Vec<u16>>,
        volume_script: Mutex<Vec<serde_json::Value>>,
    }

    async fn issue_token_handler(State(fake): State<Arc<Fake>>) -> impl IntoResponse {
        fake.issue_calls.fetch_add(1, Ordering::SeqCst);
        Json(json!({
            "accessToken": "issued-token",
            "refreshToken": "issued-refresh",
            "expiresIn": 3600,
        }))
    }

    async fn refresh_token_handler(State(fake): State<Arc<Fake>>) -> impl IntoResponse {
        fake.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Json(json!({
            "accessToken": "refreshed-token",
            "refreshToken": "refreshed-refresh",
            "expiresIn": 3600,
        }))
    }

    async fn vm_action_handler(
        State(fake): State<Arc<Fake>>,
        Path(_vm_id): Path<i64>,
    ) -> impl IntoResponse {
        fake.vm_action_calls.fetch_add(1, Ordering::SeqCst);
        let status = {
            let mut script = fake.vm_action_script.lock().unwrap();
            if script.is_empty() {
                200
            } else {
                script.remove(0)
            }
        };
        (
            AxumStatus::from_u16(status).unwrap(),
            Json(json!({"message": "scripted"})),
        )
    }

    async fn get_volume_handler(
        State(fake): State<Arc<Fake>>,
        Path(volume_id): Path<i64>,
    ) -> impl IntoResponse {
        let body = {
            let mut script = fake.volume_script.lock().unwrap();
            if script.is_empty() {
                None
            } else {
                Some(script.remove(0))
            }
        };
        match body {
            Some(body) => (AxumStatus::OK, Json(body)).into_response(),
            None => (
                AxumStatus::NOT_FOUND,
                Json(json!({"message": format!("volume {volume_id} not found")})),
            )
                .into_response(),
        }
    }

    async fn create_volume_handler(State(_fake): State<Arc<Fake>>) -> impl IntoResponse {
        (
            AxumStatus::UNPROCESSABLE_ENTITY,
            Json(json!({"message": "volumeGb must be a power of two"})),
        )
    }

    async fn delete_volume_handler(
        State(_fake): State<Arc<Fake>>,
        Path(_volume_id): Path<i64>,
    ) -> impl IntoResponse {
        AxumStatus::NOT_FOUND
    }

    async fn get_vm_handler(Path(vm_id): Path<i64>) -> impl IntoResponse {
        Json(json!({
            "id": vm_id,
            "name": format!("worker-{vm_id}"),
            "volumes": [{"id": 7}],
        }))
    }

    async fn list_vms_handler() -> impl IntoResponse {
        Json(json!([
            {"id": 42, "name": "worker-42", "volumes": []},
            {"id": 43, "name": "worker-43", "volumes": [{"id": 7}]},
        ]))
    }

    async fn get_cluster_handler(Path(cluster_id): Path<i64>) -> impl IntoResponse {
        Json(json!({
            "id": cluster_id,
            "name": "production",
            "nodeGroups": [
                {"name": "workers", "nodes": [{"id": 42, "name": "worker-1"}]},
            ],
        }))
    }

    async fn spawn_fake(fake: Arc<Fake>) -> String {
        let app = Router::new()
            .route("/v1/issue-token", post(issue_token_handler))
            .route("/v1/refresh-token", post(refresh_token_handler))
            .route("/v1/vms", get(list_vms_handler))
            .route("/v1/vms/:id", get(get_vm_handler))
            .route("/v1/vms/:id/actions", post(vm_action_handler))
            .route("/v1/volumes", post(create_volume_handler))
            .route("/v1/volumes/:id", get(get_volume_handler))
            .route("/v1/volumes/:id", delete(delete_volume_handler))
            .route("/v1/kubernetes/:id", get(get_cluster_handler))
            .with_state(fake);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Client with a pre-seeded token, mirroring a process that
    /// authenticated `remaining` ago.
    fn seeded_client(base_url: String, remaining: Duration) -> Client {
        Client {
            http: reqwest::Client::new(),
            base_url,
            client_id: "test-client".to_owned(),
            client_secret: "test-secret".to_owned(),
            token: RwLock::new(TokenState {
                access_token: "seed-token".to_owned(),
                refresh_token: "seed-refresh".to_owned(),
                expires_at: Instant::now() + remaining,
            }),
        }
    }

    fn volume_json(id: i64, status: &str, attached_to: Option<i64>) -> serde_json::Value {
        json!({
            "id": id,
            "name": format!("vol-{id}"),
            "sizeGb": 16,
            "type": "ssd",
            "status": status,
            "attachedToId": attached_to,
            "dataCenterId": "aws-eu-west-2",
        })
    }

    #[tokio::test]
    async fn expired_token_triggers_exactly_one_refresh() {
        let fake = Arc::new(Fake::default());
        {
            let mut script = fake.volume_script.lock().unwrap();
            for _ in 0..8 {
                script.push(volume_json(7, "AVAILABLE", None));
            }
        }
        let base_url = spawn_fake(Arc::clone(&fake)).await;
        // Less lifetime left than the refresh margin.
        let client = Arc::new(seeded_client(base_url, Duration::from_secs(60)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move { client.get_volume(7).await }));
        }
        for handle in handles {
            handle.await.unwrap().expect("get_volume should succeed");
        }

        assert_eq!(fake.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fake.issue_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_succeeds_after_eleven_conflicts() {
        let fake = Arc::new(Fake::default());
        *fake.vm_action_script.lock().unwrap() = vec![409; 11];
        let base_url = spawn_fake(Arc::clone(&fake)).await;
        let client = seeded_client(base_url, Duration::from_secs(3600));

        client.attach_volume(42, 7).await.expect("attach should succeed");
        assert_eq!(fake.vm_action_calls.load(Ordering::SeqCst), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_gives_up_after_retry_budget() {
        let fake = Arc::new(Fake::default());
        *fake.vm_action_script.lock().unwrap() = vec![409; 16];
        let base_url = spawn_fake(Arc::clone(&fake)).await;
        let client = seeded_client(base_url, Duration::from_secs(3600));

        let err = client.attach_volume(42, 7).await.unwrap_err();
        assert!(matches!(err, EmmaError::Conflict { .. }), "got {err:?}");
        // Initial attempt plus twelve retries.
        assert_eq!(fake.vm_action_calls.load(Ordering::SeqCst), 13);
    }

    #[tokio::test]
    async fn attach_refreshes_token_on_first_401() {
        let fake = Arc::new(Fake::default());
        *fake.vm_action_script.lock().unwrap() = vec![401];
        let base_url = spawn_fake(Arc::clone(&fake)).await;
        let client = seeded_client(base_url, Duration::from_secs(3600));

        client.attach_volume(42, 7).await.expect("attach should succeed");
        assert_eq!(fake.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fake.vm_action_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn create_volume_maps_422_to_invalid_argument() {
        let fake = Arc::new(Fake::default());
        let base_url = spawn_fake(fake).await;
        let client = seeded_client(base_url, Duration::from_secs(3600));

        let err = client
            .create_volume("pvc-1", 3, "ssd", "aws-eu-west-2")
            .await
            .unwrap_err();
        assert!(matches!(err, EmmaError::InvalidArgument(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn delete_volume_treats_404_as_success() {
        let fake = Arc::new(Fake::default());
        let base_url = spawn_fake(fake).await;
        let client = seeded_client(base_url, Duration::from_secs(3600));

        client.delete_volume(999).await.expect("delete should be idempotent");
    }

    #[tokio::test]
    async fn get_volume_maps_404_to_not_found() {
        let fake = Arc::new(Fake::default());
        let base_url = spawn_fake(fake).await;
        let client = seeded_client(base_url, Duration::from_secs(3600));

        let err = client.get_volume(999).await.unwrap_err();
        assert!(
            matches!(err, EmmaError::NotFound { kind: "volume", .. }),
            "got {err:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_status_polls_until_available() {
        let fake = Arc::new(Fake::default());
        *fake.volume_script.lock().unwrap() = vec![
            volume_json(7, "DRAFT", None),
            volume_json(7, "DRAFT", None),
            volume_json(7, "AVAILABLE", None),
        ];
        let base_url = spawn_fake(Arc::clone(&fake)).await;
        let client = seeded_client(base_url, Duration::from_secs(3600));

        let volume = client
            .wait_for_volume_status(7, VolumeStatus::Available, Duration::from_secs(300))
            .await
            .expect("wait should succeed");
        assert_eq!(volume.status, VolumeStatus::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_status_fails_fast_on_failed_volume() {
        let fake = Arc::new(Fake::default());
        *fake.volume_script.lock().unwrap() = vec![volume_json(7, "FAILED", None)];
        let base_url = spawn_fake(Arc::clone(&fake)).await;
        let client = seeded_client(base_url, Duration::from_secs(3600));

        let err = client
            .wait_for_volume_status(7, VolumeStatus::Available, Duration::from_secs(300))
            .await
            .unwrap_err();
        assert!(matches!(err, EmmaError::VolumeFailed { volume_id: 7 }), "got {err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_attachment_times_out() {
        let fake = Arc::new(Fake::default());
        {
            let mut script = fake.volume_script.lock().unwrap();
            for _ in 0..16 {
                script.push(volume_json(7, "BUSY", None));
            }
        }
        let base_url = spawn_fake(Arc::clone(&fake)).await;
        let client = seeded_client(base_url, Duration::from_secs(3600));

        let err = client
            .wait_for_volume_attachment(7, 42, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(
            matches!(err, EmmaError::Timeout { action: "attachment", .. }),
            "got {err:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_detachment_sees_released_volume() {
        let fake = Arc::new(Fake::default());
        *fake.volume_script.lock().unwrap() = vec![
            volume_json(7, "BUSY", Some(42)),
            volume_json(7, "AVAILABLE", None),
        ];
        let base_url = spawn_fake(Arc::clone(&fake)).await;
        let client = seeded_client(base_url, Duration::from_secs(3600));

        client
            .wait_for_volume_detachment(7, Duration::from_secs(300))
            .await
            .expect("wait should succeed");
    }

    #[tokio::test]
    async fn get_vm_reads_attached_volume_references() {
        let fake = Arc::new(Fake::default());
        let base_url = spawn_fake(fake).await;
        let client = seeded_client(base_url, Duration::from_secs(3600));

        let vm = client.get_vm(42).await.unwrap();
        assert_eq!(vm.id, 42);
        assert_eq!(vm.volumes.len(), 1);
        assert_eq!(vm.volumes[0].id, 7);
    }

    #[tokio::test]
    async fn list_vms_returns_every_worker() {
        let fake = Arc::new(Fake::default());
        let base_url = spawn_fake(fake).await;
        let client = seeded_client(base_url, Duration::from_secs(3600));

        let vms = client.list_vms().await.unwrap();
        assert_eq!(vms.len(), 2);
        assert_eq!(vms[1].volumes[0].id, 7);
    }

    #[tokio::test]
    async fn get_kubernetes_cluster_reads_node_groups() {
        let fake = Arc::new(Fake::default());
        let base_url = spawn_fake(fake).await;
        let client = seeded_client(base_url, Duration::from_secs(3600));

        let cluster = client.get_kubernetes_cluster(1).await.unwrap();
        assert_eq!(cluster.node_groups.len(), 1);
        assert_eq!(cluster.node_groups[0].nodes[0].name, "worker-1");
    }

    #[test]
    fn conflict_backoff_follows_documented_schedule() {
        let schedule: Vec<u64> = (0..12).map(|a| conflict_backoff(a).as_secs()).collect();
        assert_eq!(schedule, vec![1, 2, 3, 5, 8, 12, 15, 15, 15, 15, 15, 15]);
    }

    #[test]
    fn volume_json_round_trips_provider_fields() {
        let volume: Volume =
            serde_json::from_value(volume_json(123, "ACTIVE", Some(42))).unwrap();
        assert_eq!(volume.id, 123);
        assert_eq!(volume.size_gb, 16);
        assert_eq!(volume.volume_type, "ssd");
        assert_eq!(volume.status, VolumeStatus::Active);
        assert_eq!(volume.attached_to_id, Some(42));
        assert_eq!(volume.data_center_id, "aws-eu-west-2");
    }
}
