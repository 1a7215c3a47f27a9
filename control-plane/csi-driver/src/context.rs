//! Typed volume parameters.
//!
//! The orchestrator hands us untyped string maps (storage class parameters on create,
//! volume context on stage). They are parsed exactly once, at the gRPC boundary, into
//! [`VolumeParams`] / [`CreateParams`] and never threaded further as raw maps.
use snafu::Snafu;
use std::{collections::HashMap, str::FromStr};
use strum_macros::{AsRefStr, Display, EnumString};

/// Owner used when neither the storage class nor the volume context names one.
pub const DEFAULT_OWNER: &str = "csi-user";

/// The various volume context parameters.
#[derive(AsRefStr, EnumString, Display, Debug, Clone, Copy, Eq, PartialEq)]
#[strum(serialize_all = "camelCase")]
pub enum Parameters {
    /// Comma separated list of master (metadata service) addresses.
    MasterAddr,
    /// Name of the volume on the storage cluster.
    VolName,
    Owner,
    LogLevel,
    ConsulAddr,
    AccessKey,
    SecretKey,
    EnablePosixAcl,
    ReadOnly,
    /// Creation only: zone to place the volume in.
    ZoneName,
    /// Creation only.
    CrossZone,
    /// Creation only.
    VolType,
    /// Creation only.
    EnableToken,
    #[strum(serialize = "csi.storage.k8s.io/pvc/name")]
    PvcName,
    #[strum(serialize = "csi.storage.k8s.io/pvc/namespace")]
    PvcNamespace,
}

impl Parameters {
    /// The value assumed when the parameter is not present.
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            Self::LogLevel => Some("info"),
            Self::Owner => Some(DEFAULT_OWNER),
            Self::PvcNamespace => Some("default"),
            Self::EnablePosixAcl | Self::ReadOnly | Self::CrossZone | Self::EnableToken => {
                Some("false")
            }
            Self::MasterAddr
            | Self::VolName
            | Self::ConsulAddr
            | Self::AccessKey
            | Self::SecretKey
            | Self::ZoneName
            | Self::VolType
            | Self::PvcName => None,
        }
    }
    /// Parses a boolean flag, accepting the usual spellings of true and false.
    pub fn parse_bool(&self, value: &str) -> Result<bool, ParameterError> {
        match value.trim() {
            "1" | "t" | "T" | "true" | "TRUE" | "True" | "yes" => Ok(true),
            "0" | "f" | "F" | "false" | "FALSE" | "False" | "no" => Ok(false),
            other => Invalid {
                name: self.to_string(),
                value: other.to_string(),
            }
            .fail(),
        }
    }
}

/// Errors raised while parsing volume parameters.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ParameterError {
    #[snafu(display("Missing required volume parameter '{name}'"))]
    Missing { name: String },
    #[snafu(display("Invalid value '{value}' for volume parameter '{name}'"))]
    Invalid { name: String, value: String },
}

impl From<ParameterError> for tonic::Status {
    fn from(error: ParameterError) -> Self {
        tonic::Status::invalid_argument(error.to_string())
    }
}

/// Lookup helper over the raw map which applies the default table.
struct RawParams<'a>(&'a HashMap<String, String>);

impl<'a> RawParams<'a> {
    fn get(&self, param: Parameters) -> Option<&'a str> {
        self.0
            .get(param.as_ref())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
    fn string(&self, param: Parameters) -> Option<String> {
        self.get(param)
            .or_else(|| param.default_value())
            .map(ToString::to_string)
    }
    fn required(&self, param: Parameters) -> Result<String, ParameterError> {
        self.string(param).ok_or_else(|| ParameterError::Missing {
            name: param.to_string(),
        })
    }
    fn bool(&self, param: Parameters) -> Result<bool, ParameterError> {
        match self.get(param).or_else(|| param.default_value()) {
            Some(value) => param.parse_bool(value),
            None => Ok(false),
        }
    }
}

/// Connection and client parameters of a volume, as recorded in its volume context.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VolumeParams {
    /// Master addresses, in the order they should be tried.
    pub master_addrs: Vec<String>,
    pub vol_name: String,
    pub owner: String,
    pub log_level: String,
    pub consul_addr: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub enable_posix_acl: bool,
    /// Mount the volume read-only in every consumer.
    pub read_only: bool,
    pub pvc_name: Option<String>,
    pub pvc_namespace: String,
}

impl VolumeParams {
    /// Parse the parameters of the volume `volume_id`.
    /// The volume name falls back to the volume id, which is how dynamically
    /// provisioned volumes are named.
    pub fn parse(volume_id: &str, params: &HashMap<String, String>) -> Result<Self, ParameterError> {
        let raw = RawParams(params);
        let master_addrs = raw
            .required(Parameters::MasterAddr)?
            .split(',')
            .map(|addr| addr.trim().to_string())
            .filter(|addr| !addr.is_empty())
            .collect::<Vec<_>>();
        if master_addrs.is_empty() {
            return Missing {
                name: Parameters::MasterAddr.to_string(),
            }
            .fail();
        }
        Ok(Self {
            master_addrs,
            vol_name: raw
                .string(Parameters::VolName)
                .unwrap_or_else(|| volume_id.to_string()),
            owner: raw.required(Parameters::Owner)?,
            log_level: raw.required(Parameters::LogLevel)?,
            consul_addr: raw.string(Parameters::ConsulAddr),
            access_key: raw.string(Parameters::AccessKey),
            secret_key: raw.string(Parameters::SecretKey),
            enable_posix_acl: raw.bool(Parameters::EnablePosixAcl)?,
            read_only: raw.bool(Parameters::ReadOnly)?,
            pvc_name: raw.string(Parameters::PvcName),
            pvc_namespace: raw.required(Parameters::PvcNamespace)?,
        })
    }

    /// The master addresses in the comma separated form the client expects.
    pub fn master_addr(&self) -> String {
        self.master_addrs.join(",")
    }

    /// Render back into a volume context, including defaulted values.
    pub fn to_context(&self) -> HashMap<String, String> {
        let mut context = HashMap::new();
        let mut insert = |param: Parameters, value: String| {
            context.insert(param.to_string(), value);
        };
        insert(Parameters::MasterAddr, self.master_addr());
        insert(Parameters::VolName, self.vol_name.clone());
        insert(Parameters::Owner, self.owner.clone());
        insert(Parameters::LogLevel, self.log_level.clone());
        insert(Parameters::EnablePosixAcl, self.enable_posix_acl.to_string());
        insert(Parameters::ReadOnly, self.read_only.to_string());
        insert(Parameters::PvcNamespace, self.pvc_namespace.clone());
        let optional = [
            (Parameters::ConsulAddr, &self.consul_addr),
            (Parameters::AccessKey, &self.access_key),
            (Parameters::SecretKey, &self.secret_key),
            (Parameters::PvcName, &self.pvc_name),
        ];
        for (param, value) in optional {
            if let Some(value) = value {
                insert(param, value.clone());
            }
        }
        context
    }
}

/// Parameters used when creating a volume on the storage cluster.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CreateParams {
    volume: VolumeParams,
    zone_name: Option<String>,
    cross_zone: bool,
    vol_type: Option<u32>,
    enable_token: bool,
}

impl CreateParams {
    /// Parse the storage class parameters for the volume `name`.
    /// `owner` is used when the storage class does not pin one.
    pub fn parse(
        name: &str,
        params: &HashMap<String, String>,
        owner: impl FnOnce() -> String,
    ) -> Result<Self, ParameterError> {
        let mut params = params.clone();
        params
            .entry(Parameters::Owner.to_string())
            .or_insert_with(owner);
        let raw = RawParams(&params);
        let vol_type = match raw.get(Parameters::VolType) {
            Some(value) => Some(u32::from_str(value).map_err(|_| ParameterError::Invalid {
                name: Parameters::VolType.to_string(),
                value: value.to_string(),
            })?),
            None => None,
        };
        Ok(Self {
            volume: VolumeParams::parse(name, &params)?,
            zone_name: raw.string(Parameters::ZoneName),
            cross_zone: raw.bool(Parameters::CrossZone)?,
            vol_type,
            enable_token: raw.bool(Parameters::EnableToken)?,
        })
    }
    /// The volume parameters recorded into the volume context.
    pub fn volume(&self) -> &VolumeParams {
        &self.volume
    }
    /// Extra query arguments for the admin `createVol` call.
    pub fn create_query(&self) -> Vec<(String, String)> {
        let mut query = vec![
            (
                Parameters::CrossZone.to_string(),
                self.cross_zone.to_string(),
            ),
            (
                Parameters::EnableToken.to_string(),
                self.enable_token.to_string(),
            ),
        ];
        if let Some(zone) = &self.zone_name {
            query.push((Parameters::ZoneName.to_string(), zone.clone()));
        }
        if let Some(vol_type) = self.vol_type {
            query.push((Parameters::VolType.to_string(), vol_type.to_string()));
        }
        query
    }
}
