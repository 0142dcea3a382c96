//! Typed Rust client for a vSphere-style management gateway.
//!
//! Covers the subset needed for VM lifecycle management:
//! inventory lookups, VM properties, remote tasks, guest shutdown,
//! datastore directories, and the event stream.

mod types;

pub use types::*;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("vim api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("vim api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("vim event stream failed: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("vim event decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid vim api url: {0}")]
    InvalidUrl(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status, .. } if status.as_u16() == 404)
    }

    fn is_conflict(&self) -> bool {
        matches!(self, Self::Api { status, .. } if status.as_u16() == 409)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(serde::Serialize)]
struct MakeDirectoryRequest<'a> {
    path: &'a str,
    create_parents: bool,
}

/// Client for the management gateway's REST and event API.
#[derive(Clone)]
pub struct VimClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl VimClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    // ── Inventory ────────────────────────────────────────────────────

    /// Look up an object by ID. VMs are looked up by instance UUID.
    pub async fn find_object(&self, kind: ObjectKind, id: &str) -> Result<ManagedObjectRef> {
        let resp = self
            .http
            .get(self.url(&format!("/objects/{kind}/{id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "find object")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn vm_properties(&self, vm: &str) -> Result<VmProperties> {
        let resp = self
            .http
            .get(self.url(&format!("/vms/{vm}/properties")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "vm properties")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    /// Devices the platform creates implicitly for a new VM of `guest_id`
    /// placed in `pool`.
    pub async fn default_devices(&self, pool: &str, guest_id: &str) -> Result<Vec<VirtualDevice>> {
        let resp = self
            .http
            .get(self.url(&format!("/pools/{pool}/default-devices")))
            .header("Authorization", self.auth())
            .query(&[("guest_id", guest_id)])
            .send()
            .await?;

        Self::check(resp, "default devices")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn guest_os(&self, pool: &str, guest_id: &str) -> Result<GuestOsDescriptor> {
        let resp = self
            .http
            .get(self.url(&format!("/pools/{pool}/guest-os/{guest_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "guest os")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    // ── Tasks ────────────────────────────────────────────────────────

    pub async fn submit_task(&self, req: &TaskRequest) -> Result<TaskInfo> {
        let resp = self
            .http
            .post(self.url("/tasks"))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        Self::check(resp, "submit task")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TaskInfo> {
        let resp = self
            .http
            .get(self.url(&format!("/tasks/{task_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "get task")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    // ── Guest / datastore ────────────────────────────────────────────

    /// Ask the guest OS to shut down. Returns once the request is accepted.
    pub async fn shutdown_guest(&self, vm: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/vms/{vm}/shutdown-guest")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "shutdown guest").await?;
        Ok(())
    }

    /// Create a directory on a datastore. An existing directory is success.
    pub async fn make_directory(&self, datastore: &str, path: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/datastores/{datastore}/directories")))
            .header("Authorization", self.auth())
            .json(&MakeDirectoryRequest {
                path,
                create_parents: true,
            })
            .send()
            .await?;

        match Self::check(resp, "make directory").await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── Events ───────────────────────────────────────────────────────

    /// WebSocket URL of the event stream for `object`, filtered to `kinds`.
    fn events_url(&self, object: &ManagedObjectRef, kinds: &[EventKind]) -> Result<reqwest::Url> {
        let invalid = || Error::InvalidUrl(self.base_url.clone());
        let mut url = reqwest::Url::parse(&self.url("/events")).map_err(|_| invalid())?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            _ => return Err(invalid()),
        };
        url.set_scheme(scheme).map_err(|()| invalid())?;

        let filter = kinds
            .iter()
            .map(|k| serde_json::to_value(k).map(|v| v.as_str().unwrap_or_default().to_string()))
            .collect::<std::result::Result<Vec<_>, _>>()?
            .join(",");
        url.query_pairs_mut()
            .append_pair("object", &object.value)
            .append_pair("kind", object.kind.as_str())
            .append_pair("types", &filter);
        Ok(url)
    }

    /// Open an event subscription for one object, filtered to `kinds`.
    ///
    /// The stream ends when the server closes the socket. Dropping it
    /// closes the subscription.
    pub async fn subscribe_events(
        &self,
        object: &ManagedObjectRef,
        kinds: &[EventKind],
    ) -> Result<BoxStream<'static, Result<Event>>> {
        let url = self.events_url(object, kinds)?;
        let mut request = url.as_str().into_client_request()?;
        let auth: tungstenite::http::HeaderValue = self
            .auth()
            .parse()
            .map_err(|_| Error::InvalidUrl("authorization header".into()))?;
        request.headers_mut().insert("Authorization", auth);

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;

        let events = socket.filter_map(|msg| async move {
            match msg {
                Ok(tungstenite::Message::Text(text)) => {
                    Some(serde_json::from_str::<Event>(&text).map_err(Error::from))
                }
                Ok(_) => None,
                Err(e) => Some(Err(Error::from(e))),
            }
        });

        Ok(events.boxed())
    }
}
