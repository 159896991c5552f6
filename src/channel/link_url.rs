use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use anyhow::{anyhow, bail};

use crate::channel::config::ConfigName;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Protocol {
    Tcp,
    Ssl,
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Ssl => "ssl",
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    fn parse(s: &str) -> anyhow::Result<Protocol> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "ssl" => Ok(Protocol::Ssl),
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => bail!("invalid protocol {:?}: URLs have the form protocol://[user@]host:port[/{{name=value;...}}]", other),
        }
    }
}

/// A parsed connect URL: `protocol://[user@]host:port[/{name=value;name=value...}]`
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LinkUrl {
    protocol: Protocol,
    host: String,
    port: u16,
    user: Option<String>,
    /// keys of recognized properties are stored under their full name
    properties: BTreeMap<String, String>,
}

impl Display for LinkUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://", self.protocol.as_str())?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        }
        else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl LinkUrl {
    pub fn parse(url: &str) -> anyhow::Result<LinkUrl> {
        let url = url.trim();
        let (protocol, rest) = url.split_once("://")
            .ok_or_else(|| anyhow!("missing protocol in URL {:?}", url))?;
        let protocol = Protocol::parse(protocol)?;

        let (authority, properties) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx + 1..].trim()),
            None => (rest, ""),
        };

        let (user, host_and_port) = match authority.rsplit_once('@') {
            Some((user, host_and_port)) => (Some(user.to_string()), host_and_port),
            None => (None, authority),
        };

        let properties = parse_properties(properties)?;
        let defaults = EndpointDefaults::from_properties(&properties)?;
        let (host, port) = parse_host_and_port(host_and_port, &defaults)?;

        let mut result = LinkUrl {
            protocol,
            host,
            port,
            user: None,
            properties,
        };

        match user {
            Some(user) if !user.is_empty() => {
                result.properties.insert(ConfigName::ChannelUserId.name().to_string(), user.clone());
                result.user = Some(user);
            }
            _ => {
                result.user = result.property(ConfigName::ChannelUserId).map(|s| s.to_string());
            }
        }

        Ok(result)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, name: ConfigName) -> Option<&str> {
        self.properties.get(name.name())
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    /// `host:port` in a form that can be resolved, with IPv6 addresses in brackets
    pub fn socket_addr_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        }
        else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The failover set: this URL followed by one URL per entry of the 'ftHosts' property. All
    ///  entries share this URL's protocol, user and properties.
    pub fn failover_urls(&self) -> anyhow::Result<Vec<LinkUrl>> {
        let mut result = vec![self.clone()];

        if let Some(ft_hosts) = self.property(ConfigName::ChannelFtHosts) {
            let defaults = EndpointDefaults::from_properties(&self.properties)?;
            for entry in ft_hosts.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
                let (host, port) = parse_host_and_port(entry, &defaults)?;
                result.push(LinkUrl {
                    host,
                    port,
                    ..self.clone()
                });
            }
        }
        Ok(result)
    }
}

/// Host and port for endpoints that omit them, from the 'defaultHost' and 'defaultPort' properties
struct EndpointDefaults {
    host: String,
    port: u16,
}

impl EndpointDefaults {
    fn from_properties(properties: &BTreeMap<String, String>) -> anyhow::Result<EndpointDefaults> {
        let property = |name: ConfigName| {
            properties.get(name.name())
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .unwrap_or(name.default_value())
        };

        let port = property(ConfigName::ChannelDefaultPort);
        Ok(EndpointDefaults {
            host: property(ConfigName::ChannelDefaultHost).to_ascii_lowercase(),
            port: port.parse()
                .map_err(|_| anyhow!("invalid default port {:?}", port))?,
        })
    }
}

fn parse_host_and_port(s: &str, defaults: &EndpointDefaults) -> anyhow::Result<(String, u16)> {
    let s = s.trim();
    let default_host = defaults.host.as_str();
    let default_port = defaults.port;

    if s.is_empty() {
        return Ok((default_host.to_string(), default_port));
    }

    if let Some(bracketed) = s.strip_prefix('[') {
        let (host, rest) = bracketed.split_once(']')
            .ok_or_else(|| anyhow!("unterminated IPv6 address in {:?}", s))?;
        if host.len() < 2 {
            bail!("invalid or missing host name in {:?}", s);
        }
        let port = match rest.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if rest.is_empty() => default_port,
            None => bail!("invalid characters after IPv6 address in {:?}", s),
        };
        return Ok((host.to_ascii_lowercase(), port));
    }

    match s.split_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                bail!("invalid or missing host name in {:?}", s);
            }
            Ok((host.to_ascii_lowercase(), parse_port(port)?))
        }
        None => {
            if !s.contains('.') && s.chars().all(|c| c.is_ascii_digit()) {
                // a bare port number
                Ok((default_host.to_string(), parse_port(s)?))
            }
            else {
                Ok((s.to_ascii_lowercase(), default_port))
            }
        }
    }
}

fn parse_port(s: &str) -> anyhow::Result<u16> {
    let s = s.trim();
    if s.is_empty() {
        bail!("invalid or missing port number");
    }
    s.parse()
        .map_err(|_| anyhow!("invalid port number {:?}", s))
}

fn parse_properties(s: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let mut result = BTreeMap::new();
    if s.is_empty() {
        return Ok(result);
    }

    let inner = s.strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| anyhow!("malformed URL properties {:?}: must be enclosed in {{}}, with name=value pairs separated by ';'", s))?;

    for kv in inner.split(';').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let (key, value) = kv.split_once('=')
            .ok_or_else(|| anyhow!("malformed URL property {:?}: expected name=value", kv))?;
        let key = key.trim();
        let key = match ConfigName::from_name(key) {
            Some(name) => name.name().to_string(),
            None => key.to_ascii_lowercase(),
        };
        result.insert(key, value.trim().to_string());
    }
    Ok(result)
}
