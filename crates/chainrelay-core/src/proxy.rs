//! Forward-proxy credentials, shared by the TCP tunnel and the HTTP client.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Parsed `HOST:PORT:USERNAME:PASSWORD` proxy string.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ProxyConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `http://host:port`, without credentials.
    pub fn url(&self) -> String {
        format!("http://{}", self.address())
    }

    /// Value of a `Proxy-Authorization: Basic` header.
    pub fn basic_auth(&self) -> String {
        base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password))
    }
}

impl FromStr for ProxyConfig {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [host, port, username, password] = parts.as_slice() else {
            return Err(ValidationError::InvalidProxy(format!(
                "expected 4 ':'-separated fields, got {}",
                parts.len()
            )));
        };
        if host.is_empty() {
            return Err(ValidationError::InvalidProxy("empty host".into()));
        }
        let port = port
            .parse()
            .map_err(|_| ValidationError::InvalidProxy(format!("bad port '{port}'")))?;
        Ok(Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// Config files carry the proxy in its four-field string form.
impl Serialize for ProxyConfig {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&format_args!(
            "{}:{}:{}:{}",
            self.host, self.port, self.username, self.password
        ))
    }
}

impl<'de> Deserialize<'de> for ProxyConfig {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_four_field_proxy_string() {
        let p: ProxyConfig = "10.0.0.1:3128:alice:s3cret".parse().unwrap();
        assert_eq!(p.address(), "10.0.0.1:3128");
        assert_eq!(p.url(), "http://10.0.0.1:3128");
        assert_eq!(p.username, "alice");
        // base64("alice:s3cret")
        assert_eq!(p.basic_auth(), "YWxpY2U6czNjcmV0");
        assert!(!format!("{p:?}").contains("s3cret"));
    }

    #[test]
    fn rejects_malformed_proxy_strings() {
        for bad in ["10.0.0.1:3128", "10.0.0.1:3128:a:b:c", ":3128:a:b", "h:port:a:b"] {
            assert!(
                matches!(bad.parse::<ProxyConfig>(), Err(ValidationError::InvalidProxy(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn config_form_is_the_proxy_string() {
        let p: ProxyConfig = serde_json::from_str(r#""proxy.local:8080:bob:pw""#).unwrap();
        assert_eq!(p.port, 8080);
        assert_eq!(serde_json::to_string(&p).unwrap(), r#""proxy.local:8080:bob:pw""#);
        assert!(serde_json::from_str::<ProxyConfig>(r#""proxy.local""#).is_err());
    }
}
