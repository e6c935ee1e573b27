// src/attachments/import.rs

//! Import-from-URL with SSRF mitigation: private, loopback and link-local
//! targets are refused unless configuration explicitly allows them.

use std::net::IpAddr;

use futures::TryStreamExt;
use url::{Host, Url};

use crate::error::{CoreError, CoreResult};

use super::ByteStream;

pub struct UrlImporter {
    client: reqwest::Client,
    allow_private: bool,
}

impl UrlImporter {
    pub fn new(allow_private: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            allow_private,
        }
    }

    /// Validate the target without touching the network beyond DNS. Called
    /// before an attachment record exists, so refusals fail the create call
    /// outright instead of producing a FAILED record.
    pub async fn validate(&self, source_url: &str) -> CoreResult<Url> {
        let url = Url::parse(source_url)
            .map_err(|e| CoreError::invalid_argument(format!("malformed source url: {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(CoreError::invalid_argument(format!(
                "unsupported source url scheme {:?}",
                url.scheme()
            )));
        }
        if self.allow_private {
            return Ok(url);
        }

        let port = url.port_or_known_default().unwrap_or(443);
        match url.host() {
            Some(Host::Ipv4(ip)) => self.refuse_private(IpAddr::V4(ip))?,
            Some(Host::Ipv6(ip)) => self.refuse_private(IpAddr::V6(ip))?,
            Some(Host::Domain(domain)) => {
                let addrs = tokio::net::lookup_host((domain, port)).await.map_err(|e| {
                    CoreError::unavailable(format!("source url did not resolve: {e}"))
                })?;
                for addr in addrs {
                    self.refuse_private(addr.ip())?;
                }
            }
            None => {
                return Err(CoreError::invalid_argument("source url has no host"));
            }
        }
        Ok(url)
    }

    fn refuse_private(&self, ip: IpAddr) -> CoreResult<()> {
        if is_private_address(ip) {
            return Err(CoreError::invalid_argument(format!(
                "source url resolves to a private address ({ip})"
            )));
        }
        Ok(())
    }

    /// Stream the body of an already-validated URL.
    pub async fn fetch(&self, url: &Url) -> CoreResult<ByteStream> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| CoreError::unavailable(format!("source fetch failed: {e}")))?
            .error_for_status()
            .map_err(|e| CoreError::unavailable(format!("source returned an error: {e}")))?;

        Ok(Box::pin(response.bytes_stream().map_err(|e| {
            CoreError::unavailable(format!("source stream failed: {e}"))
        })))
    }
}

fn is_private_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // 100.64.0.0/10 carrier-grade NAT
                || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
                || octets[0] == 0
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_address(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (segments[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges_are_detected() {
        for raw in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.9",
            "192.168.1.1",
            "169.254.0.5",
            "100.64.3.4",
            "0.0.0.0",
            "::1",
            "fc00::1",
            "fe80::1",
            "::ffff:127.0.0.1",
        ] {
            let ip: IpAddr = raw.parse().unwrap();
            assert!(is_private_address(ip), "{raw} should be private");
        }
    }

    #[test]
    fn public_addresses_pass() {
        for raw in ["93.184.216.34", "2606:2800:220:1:248:1893:25c8:1946"] {
            let ip: IpAddr = raw.parse().unwrap();
            assert!(!is_private_address(ip), "{raw} should be public");
        }
    }

    #[tokio::test]
    async fn loopback_url_is_refused() {
        let importer = UrlImporter::new(false);
        assert!(importer.validate("http://127.0.0.1:8080/x").await.is_err());
        assert!(importer.validate("ftp://example.com/x").await.is_err());
    }

    #[tokio::test]
    async fn allow_private_bypasses_the_guard() {
        let importer = UrlImporter::new(true);
        assert!(importer.validate("http://127.0.0.1:8080/x").await.is_ok());
    }
}
