//! HTTP client for the master API.
//!
//! Every response is wrapped in a `{ code, data, message }` envelope; only
//! `code == 200` counts as success. The long-poll client carries two
//! separate deadlines: a 5 s connect deadline and a 60 s overall one. The
//! 60 s mark is the poll interval itself, so hitting it is not an error.
//! Only a failure during the connect phase is reported to the caller.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;

const USER_AGENT_VALUE: &str = "TeaWeb Agent";
const HEADER_AGENT_ID: &str = "Tea-Agent-Id";
const HEADER_AGENT_KEY: &str = "Tea-Agent-Key";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared-secret identity sent with every request. Re-read from the agent
/// before each call because a config install may re-key the agent.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub id: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterEvent {
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigData {
    config: String,
}

#[derive(Debug, Deserialize)]
struct EventsData {
    #[serde(default)]
    events: Vec<MasterEvent>,
}

pub struct MasterClient {
    base: String,
    client: Client,
    poll_client: Client,
}

impl MasterClient {
    pub fn new(master_url: &str) -> Result<Self> {
        if master_url.is_empty() {
            bail!("'master' should not be empty");
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("cannot build http client")?;
        let poll_client = Client::builder()
            .connect_timeout(POLL_CONNECT_TIMEOUT)
            .timeout(POLL_TIMEOUT)
            .build()
            .context("cannot build long-poll http client")?;
        Ok(Self {
            base: master_url.trim_end_matches('/').to_string(),
            client,
            poll_client,
        })
    }

    /// `GET /api/agent`: the current config for this agent as a YAML string.
    pub async fn fetch_config(&self, creds: &Credentials) -> Result<String> {
        let resp = self
            .request(&self.client, Method::GET, "/api/agent", creds)
            .send()
            .await
            .context("cannot reach master")?;
        let data: ConfigData = read_envelope(resp).await?;
        Ok(data.config)
    }

    /// `GET /api/agent/pull`: block on the master until events arrive or the
    /// poll interval elapses. An elapsed interval returns zero events so the
    /// caller re-polls immediately; only connect-phase failures are errors.
    pub async fn pull_events(&self, creds: &Credentials) -> Result<Vec<MasterEvent>> {
        let resp = match self
            .request(&self.poll_client, Method::GET, "/api/agent/pull", creds)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_connect() => {
                return Err(anyhow!(e).context("cannot reach master"));
            }
            // Read-phase timeout: the long poll simply came up empty.
            Err(_) => return Ok(Vec::new()),
        };
        let data: EventsData = read_envelope(resp).await?;
        Ok(data.events)
    }

    /// `PUT /api/agent/push`: deliver one spooled event. The caller deletes
    /// the spool record only when this returns `Ok`.
    pub async fn push_event(&self, creds: &Credentials, body: Vec<u8>) -> Result<()> {
        let resp = self
            .request(&self.client, Method::PUT, "/api/agent/push", creds)
            .body(body)
            .send()
            .await
            .context("cannot reach master")?;
        check_envelope(resp).await
    }

    fn request(
        &self,
        client: &Client,
        method: Method,
        path: &str,
        creds: &Credentials,
    ) -> RequestBuilder {
        client
            .request(method, format!("{}{}", self.base, path))
            .header(reqwest::header::USER_AGENT, USER_AGENT_VALUE)
            .header(HEADER_AGENT_ID, &creds.id)
            .header(HEADER_AGENT_KEY, &creds.key)
    }
}

/// Unwrap the envelope and deserialize `data` into the expected shape.
async fn read_envelope<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let data = envelope_data(resp).await?;
    let Some(data) = data else {
        bail!("response json data should be a map");
    };
    serde_json::from_value(data).context("unexpected response data from master")
}

/// Envelope check only, for endpoints whose `data` is irrelevant.
async fn check_envelope(resp: Response) -> Result<()> {
    envelope_data(resp).await.map(|_| ())
}

async fn envelope_data(resp: Response) -> Result<Option<serde_json::Value>> {
    let status = resp.status();
    if status.as_u16() != 200 {
        bail!("invalid status response from master '{}'", status.as_u16());
    }
    let body = resp.text().await.context("cannot read master response")?;
    let envelope: Envelope =
        serde_json::from_str(&body).context("invalid response body from master")?;
    if envelope.code != 200 {
        match envelope.message {
            Some(message) if !message.is_empty() => {
                bail!("invalid response from master: {message}")
            }
            _ => bail!("invalid response from master: {body}"),
        }
    }
    Ok(envelope.data)
}
