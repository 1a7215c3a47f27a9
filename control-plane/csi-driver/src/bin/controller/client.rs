//! Client of the storage cluster's master admin API.
//!
//! Every call is a plain `GET` with query arguments, answered by a JSON envelope
//! `{code, msg, data}`. The master addresses of a volume are tried in order until one
//! of them gives an accepted answer.
use csi_driver::{CreateParams, VolumeParams};
use md5::{Digest, Md5};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use std::time::Duration;
use strum_macros::Display;
use tracing::{debug, instrument, warn};

/// Admin code answered for a volume which does not exist.
const VOLUME_NOT_EXISTS: i32 = 7;
/// Message fragment answered when creating a volume which already exists.
const DUPLICATE_VOLUME: &str = "duplicate vol";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub(crate) enum AdminError {
    #[snafu(display("Failed to build the admin http client: {source}"))]
    Build { source: reqwest::Error },
    #[snafu(display("Admin request {url} failed: {source}"))]
    Request { source: reqwest::Error, url: String },
    #[snafu(display("Invalid admin response from {url}: {source}"))]
    Decode { source: reqwest::Error, url: String },
    #[snafu(display(
        "Master {master} refused to {op} volume '{volume}': code {code}, {msg}"
    ))]
    Rejected {
        master: String,
        op: AdminOp,
        volume: String,
        code: i32,
        msg: String,
    },
    #[snafu(display("No master address to {op} volume '{volume}'"))]
    NoMasters { op: AdminOp, volume: String },
}

impl From<AdminError> for tonic::Status {
    fn from(error: AdminError) -> Self {
        match error {
            AdminError::Build { .. } | AdminError::Request { .. } | AdminError::Decode { .. } => {
                tonic::Status::unavailable(error.to_string())
            }
            AdminError::Rejected { .. } => tonic::Status::internal(error.to_string()),
            AdminError::NoMasters { .. } => tonic::Status::invalid_argument(error.to_string()),
        }
    }
}

/// The admin operations on volumes.
#[derive(Debug, Display, Clone, Copy, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum AdminOp {
    Create,
    Delete,
    Expand,
}

impl AdminOp {
    fn path(&self) -> &'static str {
        match self {
            Self::Create => "admin/createVol",
            Self::Delete => "vol/delete",
            Self::Expand => "vol/expand",
        }
    }
    /// Whether the reply means the operation took effect, or had already.
    fn accepts(&self, reply: &AdminReply) -> bool {
        reply.code == 0
            || match self {
                Self::Create => reply.msg.contains(DUPLICATE_VOLUME),
                Self::Delete => reply.code == VOLUME_NOT_EXISTS,
                Self::Expand => false,
            }
    }
}

/// The envelope of every admin reply.
#[derive(Debug, Deserialize)]
pub(crate) struct AdminReply {
    pub(crate) code: i32,
    #[serde(default)]
    pub(crate) msg: String,
    #[serde(default)]
    pub(crate) data: serde_json::Value,
}

/// The key which authorizes changes to a volume: the md5 of its owner, in hex.
pub(crate) fn auth_key(owner: &str) -> String {
    hex::encode(Md5::digest(owner.as_bytes()))
}

fn create_query(params: &CreateParams, capacity_gib: u64) -> Vec<(String, String)> {
    let volume = params.volume();
    let mut query = vec![
        ("name".to_string(), volume.vol_name.clone()),
        ("capacity".to_string(), capacity_gib.to_string()),
        ("owner".to_string(), volume.owner.clone()),
    ];
    query.extend(params.create_query());
    query
}

fn delete_query(params: &VolumeParams) -> Vec<(String, String)> {
    vec![
        ("name".to_string(), params.vol_name.clone()),
        ("authKey".to_string(), auth_key(&params.owner)),
    ]
}

fn expand_query(params: &VolumeParams, capacity_gib: u64) -> Vec<(String, String)> {
    let mut query = delete_query(params);
    query.push(("capacity".to_string(), capacity_gib.to_string()));
    query
}

/// Volume management on the storage cluster.
#[tonic::async_trait]
pub(crate) trait VolumeAdmin: Send + Sync + 'static {
    /// Create the volume, succeeding if it exists already.
    async fn create_volume(&self, params: &CreateParams, capacity_gib: u64)
        -> Result<(), AdminError>;
    /// Delete the volume, succeeding if it does not exist.
    async fn delete_volume(&self, params: &VolumeParams) -> Result<(), AdminError>;
    /// Grow the volume to the given capacity.
    async fn expand_volume(&self, params: &VolumeParams, capacity_gib: u64)
        -> Result<(), AdminError>;
}

/// Http client of the master admin API.
#[derive(Debug, Clone)]
pub(crate) struct MasterClient {
    http: reqwest::Client,
}

impl MasterClient {
    /// New client, with the given timeout for each request.
    pub(crate) fn new(timeout: Duration) -> Result<Self, AdminError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context(Build)?;
        Ok(Self { http })
    }

    /// Issue the operation against each master in turn, returning the first accepted reply.
    #[instrument(level = "debug", skip(self, masters, query), err)]
    async fn call(
        &self,
        op: AdminOp,
        volume: &str,
        masters: &[String],
        query: Vec<(String, String)>,
    ) -> Result<AdminReply, AdminError> {
        let mut last_error = None;
        for master in masters {
            match self.call_master(op, volume, master, &query).await {
                Ok(reply) => return Ok(reply),
                Err(error) => {
                    warn!(%error, master, "Admin request failed");
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| AdminError::NoMasters {
            op,
            volume: volume.to_string(),
        }))
    }

    async fn call_master(
        &self,
        op: AdminOp,
        volume: &str,
        master: &str,
        query: &[(String, String)],
    ) -> Result<AdminReply, AdminError> {
        let url = format!("http://{master}/{}", op.path());
        let reply = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .context(Request { url: &url })?
            .json::<AdminReply>()
            .await
            .context(Decode { url: &url })?;
        debug!(master, %op, volume, code = reply.code, msg = %reply.msg, data = %reply.data, "Admin reply");

        if !op.accepts(&reply) {
            return Rejected {
                master,
                op,
                volume,
                code: reply.code,
                msg: reply.msg,
            }
            .fail();
        }
        Ok(reply)
    }
}

#[tonic::async_trait]
impl VolumeAdmin for MasterClient {
    async fn create_volume(
        &self,
        params: &CreateParams,
        capacity_gib: u64,
    ) -> Result<(), AdminError> {
        let volume = params.volume();
        let query = create_query(params, capacity_gib);
        self.call(AdminOp::Create, &volume.vol_name, &volume.master_addrs, query)
            .await?;
        Ok(())
    }

    async fn delete_volume(&self, params: &VolumeParams) -> Result<(), AdminError> {
        let query = delete_query(params);
        self.call(AdminOp::Delete, &params.vol_name, &params.master_addrs, query)
            .await?;
        Ok(())
    }

    async fn expand_volume(
        &self,
        params: &VolumeParams,
        capacity_gib: u64,
    ) -> Result<(), AdminError> {
        let query = expand_query(params, capacity_gib);
        self.call(AdminOp::Expand, &params.vol_name, &params.master_addrs, query)
            .await?;
        Ok(())
    }
}
