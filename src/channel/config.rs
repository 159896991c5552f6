use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tracing::debug;

use crate::pdu::HEADER_LEN;

/// The recognized channel properties. Every property has a fully qualified name and a short alias,
///  and both are matched case-insensitively.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ConfigName {
    ChannelDefaultHost,
    ChannelDefaultPort,
    ChannelSendSize,
    ChannelRecvSize,
    ChannelPingInterval,
    ChannelConnectTimeout,
    ChannelFtHosts,
    ChannelFtRetryIntervalSeconds,
    ChannelFtRetryCount,
    ChannelUserId,
    ChannelPassword,
    ChannelClientId,
    ConnectionOperationTimeoutSeconds,
    TlsTrustedCertificates,
    TlsExpectedHostName,
}

impl ConfigName {
    pub const ALL: [ConfigName; 15] = [
        ConfigName::ChannelDefaultHost,
        ConfigName::ChannelDefaultPort,
        ConfigName::ChannelSendSize,
        ConfigName::ChannelRecvSize,
        ConfigName::ChannelPingInterval,
        ConfigName::ChannelConnectTimeout,
        ConfigName::ChannelFtHosts,
        ConfigName::ChannelFtRetryIntervalSeconds,
        ConfigName::ChannelFtRetryCount,
        ConfigName::ChannelUserId,
        ConfigName::ChannelPassword,
        ConfigName::ChannelClientId,
        ConfigName::ConnectionOperationTimeoutSeconds,
        ConfigName::TlsTrustedCertificates,
        ConfigName::TlsExpectedHostName,
    ];

    pub fn name(self) -> &'static str {
        self.definition().0
    }

    pub fn alias(self) -> &'static str {
        self.definition().1
    }

    pub fn default_value(self) -> &'static str {
        self.definition().2
    }

    fn definition(self) -> (&'static str, &'static str, &'static str) {
        match self {
            ConfigName::ChannelDefaultHost => ("tgdb.channel.defaultHost", "defaultHost", "localhost"),
            ConfigName::ChannelDefaultPort => ("tgdb.channel.defaultPort", "defaultPort", "8700"),
            ConfigName::ChannelSendSize => ("tgdb.channel.sendSize", "sendSize", "122"),
            ConfigName::ChannelRecvSize => ("tgdb.channel.recvSize", "recvSize", "128"),
            ConfigName::ChannelPingInterval => ("tgdb.channel.pingInterval", "pingInterval", "30"),
            ConfigName::ChannelConnectTimeout => ("tgdb.channel.connectTimeout", "connectTimeout", "1000"),
            ConfigName::ChannelFtHosts => ("tgdb.channel.ftHosts", "ftHosts", ""),
            ConfigName::ChannelFtRetryIntervalSeconds => ("tgdb.channel.ftRetryIntervalSeconds", "ftRetryIntervalSeconds", "10"),
            ConfigName::ChannelFtRetryCount => ("tgdb.channel.ftRetryCount", "ftRetryCount", "3"),
            ConfigName::ChannelUserId => ("tgdb.channel.userID", "userID", ""),
            ConfigName::ChannelPassword => ("tgdb.channel.password", "password", ""),
            ConfigName::ChannelClientId => ("tgdb.channel.clientId", "clientId", "tgdb.rust-client"),
            ConfigName::ConnectionOperationTimeoutSeconds => ("tgdb.connection.operationTimeoutSeconds", "connectionOperationTimeoutSeconds", "10"),
            ConfigName::TlsTrustedCertificates => ("tgdb.tls.trustedCertificates", "trustedCertificates", ""),
            ConfigName::TlsExpectedHostName => ("tgdb.tls.expectedHostName", "expectedHostName", ""),
        }
    }

    /// Look up a property by its full name or its alias, ignoring case
    pub fn from_name(name: &str) -> Option<ConfigName> {
        let name = name.trim();
        ConfigName::ALL.iter()
            .find(|c| c.name().eq_ignore_ascii_case(name) || c.alias().eq_ignore_ascii_case(name))
            .copied()
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// socket send buffer size in KB
    pub send_buffer_kb: u32,
    /// socket receive buffer size in KB
    pub recv_buffer_kb: u32,

    /// keepalive interval of this channel
    pub ping_interval: Duration,
    pub connect_timeout: Duration,

    /// pause between two connection attempts to the same endpoint during failover
    pub ft_retry_interval: Duration,
    /// connection attempts per endpoint during failover
    pub ft_retry_count: u32,

    pub user_id: Option<String>,
    /// opaque, passed to the server as it is
    pub password: Vec<u8>,
    pub client_id: String,

    /// upper bound for waiting on a reconnect that is driven by a different task
    pub operation_timeout: Duration,

    /// PEM files with the certificates to trust for TLS connections
    pub trusted_certificates: Vec<PathBuf>,
    /// overrides the URL's host for TLS server name verification
    pub expected_host_name: Option<String>,

    /// frames with a declared length above this are rejected before their body is read
    pub max_frame_len: usize,
    /// `None` waits for a reply until it arrives or the channel is disconnected
    pub response_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig::new()
    }
}

impl ChannelConfig {
    pub fn new() -> ChannelConfig {
        ChannelConfig {
            send_buffer_kb: 122,
            recv_buffer_kb: 128,
            ping_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(1000),
            ft_retry_interval: Duration::from_secs(10),
            ft_retry_count: 3,
            user_id: None,
            password: Vec::new(),
            client_id: "tgdb.rust-client".to_string(),
            operation_timeout: Duration::from_secs(10),
            trusted_certificates: Vec::new(),
            expected_host_name: None,
            max_frame_len: 64*1024*1024,
            response_timeout: None,
        }
    }

    /// Start from the defaults and apply all recognized properties. Unknown keys are ignored.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> anyhow::Result<ChannelConfig> {
        let mut result = ChannelConfig::new();
        for (key, value) in properties {
            match ConfigName::from_name(key) {
                Some(name) => result.apply(name, value)
                    .with_context(|| format!("invalid value {:?} for property {}", value, name.name()))?,
                None => debug!("ignoring unrecognized channel property {}", key),
            }
        }
        Ok(result)
    }

    fn apply(&mut self, name: ConfigName, value: &str) -> anyhow::Result<()> {
        let value = value.trim();
        match name {
            // resolved by the URL, along with its failover set
            ConfigName::ChannelDefaultHost => {}
            ConfigName::ChannelDefaultPort => {
                value.parse::<u16>()?;
            }
            ConfigName::ChannelSendSize => self.send_buffer_kb = value.parse()?,
            ConfigName::ChannelRecvSize => self.recv_buffer_kb = value.parse()?,
            ConfigName::ChannelPingInterval => self.ping_interval = Duration::from_secs(value.parse()?),
            ConfigName::ChannelConnectTimeout => self.connect_timeout = Duration::from_millis(value.parse()?),
            ConfigName::ChannelFtHosts => {} // part of the URL's failover set
            ConfigName::ChannelFtRetryIntervalSeconds => self.ft_retry_interval = Duration::from_secs(value.parse()?),
            ConfigName::ChannelFtRetryCount => self.ft_retry_count = value.parse()?,
            ConfigName::ChannelUserId => self.user_id = non_empty(value),
            ConfigName::ChannelPassword => self.password = value.as_bytes().to_vec(),
            ConfigName::ChannelClientId => {
                if !value.is_empty() {
                    self.client_id = value.to_string();
                }
            }
            ConfigName::ConnectionOperationTimeoutSeconds => self.operation_timeout = Duration::from_secs(value.parse()?),
            ConfigName::TlsTrustedCertificates => {
                self.trusted_certificates = value.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect();
            }
            ConfigName::TlsExpectedHostName => self.expected_host_name = non_empty(value),
        }
        Ok(())
    }

    pub fn send_buffer_size(&self) -> anyhow::Result<u32> {
        self.send_buffer_kb.checked_mul(1024)
            .ok_or_else(|| anyhow!("send buffer size of {} KB is too big", self.send_buffer_kb))
    }

    pub fn recv_buffer_size(&self) -> anyhow::Result<u32> {
        self.recv_buffer_kb.checked_mul(1024)
            .ok_or_else(|| anyhow!("receive buffer size of {} KB is too big", self.recv_buffer_kb))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ft_retry_count == 0 {
            bail!("ftRetryCount must be at least 1");
        }
        if self.connect_timeout.is_zero() {
            bail!("connectTimeout must be positive");
        }
        if self.operation_timeout.is_zero() {
            bail!("operation timeout must be positive");
        }
        if self.ping_interval.is_zero() {
            bail!("pingInterval must be positive");
        }
        if self.response_timeout == Some(Duration::ZERO) {
            bail!("response timeout must be positive");
        }
        if self.max_frame_len < HEADER_LEN || self.max_frame_len > i32::MAX as usize {
            bail!("max frame length {} is outside the range of valid frame lengths", self.max_frame_len);
        }
        self.send_buffer_size()?;
        self.recv_buffer_size()?;
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    }
    else {
        Some(value.to_string())
    }
}
