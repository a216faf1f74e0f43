//! Broker endpoint parsing and TLS material loading for the MQTT transport.

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport as MqttSocket;
use std::path::Path;

/// PEM-encoded TLS material read from disk.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    pub ca: Option<Vec<u8>>,
    /// Client certificate and key, for mutual TLS.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = ca_path
            .map(|path| {
                std::fs::read(path)
                    .with_context(|| format!("failed to read broker CA '{}'", path.display()))
            })
            .transpose()?;

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!("failed to read client cert '{}'", cert_path.display())
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => return Err(anyhow!("client certificate provided without key")),
            (None, Some(_)) => return Err(anyhow!("client key provided without certificate")),
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl BrokerEndpoint {
    /// Parse `mqtt://host:port`, `mqtts://host:port`, `[::1]:1883` or `host:port`.
    pub fn parse(addr: &str) -> Result<Self> {
        let mut use_tls = false;
        let mut remainder = addr.trim();

        if let Some((scheme, rest)) = remainder.split_once("://") {
            match scheme {
                "mqtt" | "tcp" => {}
                "mqtts" | "ssl" => use_tls = true,
                other => return Err(anyhow!("unsupported broker scheme: {}", other)),
            }
            remainder = rest;
        }

        let (host, port) = split_host_port(remainder)?;
        if host.is_empty() {
            return Err(anyhow!("missing broker host in {}", addr));
        }
        Ok(Self {
            host,
            port,
            use_tls,
        })
    }

    /// Socket transport for this endpoint. TLS material on a plain endpoint
    /// is rejected rather than ignored.
    pub fn socket(&self, materials: &TlsMaterials) -> Result<MqttSocket> {
        if !self.use_tls {
            if materials.is_configured() {
                return Err(anyhow!(
                    "TLS material configured but broker address {}:{} is not mqtts://",
                    self.host,
                    self.port
                ));
            }
            return Ok(MqttSocket::tcp());
        }
        if !materials.is_configured() {
            return Ok(MqttSocket::tls_with_default_config());
        }
        let ca = materials
            .ca
            .clone()
            .ok_or_else(|| anyhow!("a broker CA certificate is required with client certificates"))?;
        Ok(MqttSocket::tls(ca, materials.client_auth.clone(), None))
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid broker address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing broker port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid broker port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing broker port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid broker port in {}", addr))?;
    Ok((host.to_string(), port))
}
