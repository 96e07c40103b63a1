use crate::config::{NetcenterConfig, USER_AGENT};
use crate::error::{NetcenterError, Result};
use crate::xml::{self, InsertRequest, NameToIp};
use reqwest::Method;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// An address record bound to a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsedAddress {
    pub ip: IpAddr,
    pub fqdn: String,
}

/// Thin client over the Netcenter `nameToIP` REST API.
#[derive(Clone)]
pub struct NetcenterClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    isg_group: String,
}

impl NetcenterClient {
    pub fn new(config: &NetcenterConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(NetcenterError::Http)?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
            isg_group: config.isg_group.clone(),
        })
    }

    pub async fn free_ipv4s(&self, subnet: Ipv4Addr) -> Result<Vec<Ipv4Addr>> {
        let body = self
            .request(Method::GET, &format!("/nameToIP/freeIps/v4/{}", subnet), None)
            .await?;
        let list: xml::FreeIpv4List = xml::from_xml(&body)?;
        list.entries.iter().map(|e| parse_ip(&e.ip)).collect()
    }

    pub async fn free_ipv6s(&self, subnet: Ipv6Addr) -> Result<Vec<Ipv6Addr>> {
        let body = self
            .request(Method::GET, &format!("/nameToIP/freeIps/v6/{}", subnet), None)
            .await?;
        let list: xml::FreeIpv6List = xml::from_xml(&body)?;
        list.entries.iter().map(|e| parse_ip(&e.ipv6)).collect()
    }

    pub async fn used_ipv4s(&self, subnet: Ipv4Addr) -> Result<Vec<UsedAddress>> {
        let body = self
            .request(Method::GET, &format!("/nameToIP/usedIps/v4/{}", subnet), None)
            .await?;
        let list: xml::UsedIpv4List = xml::from_xml(&body)?;
        list.entries
            .iter()
            .map(|e| {
                Ok(UsedAddress {
                    ip: IpAddr::V4(parse_ip(&e.ip)?),
                    fqdn: e.fqname.clone(),
                })
            })
            .collect()
    }

    pub async fn used_ipv6s(&self, subnet: Ipv6Addr) -> Result<Vec<UsedAddress>> {
        let body = self
            .request(Method::GET, &format!("/nameToIP/usedIps/v6/{}", subnet), None)
            .await?;
        let list: xml::UsedIpv6List = xml::from_xml(&body)?;
        list.entries
            .iter()
            .map(|e| {
                Ok(UsedAddress {
                    ip: IpAddr::V6(parse_ip(&e.ipv6)?),
                    fqdn: e.fqname.clone(),
                })
            })
            .collect()
    }

    /// Bind `fqdn` to `ip` with a reverse record.
    pub async fn create_dns_entry(&self, ip: IpAddr, fqdn: &str) -> Result<()> {
        let (v4, v6) = match ip {
            IpAddr::V4(ip) => (Some(ip.to_string()), None),
            IpAddr::V6(ip) => (None, Some(ip.to_string())),
        };
        let body = xml::to_xml(&InsertRequest {
            name_to_ip: NameToIp {
                ip: v4,
                ipv6: v6,
                reverse: "Y".to_string(),
                isg_group: self.isg_group.clone(),
                fq_name: fqdn.to_string(),
            },
        })?;

        self.request(Method::POST, "/nameToIP", Some(body)).await?;
        tracing::info!("[Netcenter] Created DNS entry {} -> {}", fqdn, ip);
        Ok(())
    }

    pub async fn delete_dns_entry(&self, ip: IpAddr) -> Result<()> {
        self.request(Method::DELETE, &format!("/nameToIP/{}", ip), None)
            .await?;
        tracing::info!("[Netcenter] Deleted DNS entry for {}", ip);
        Ok(())
    }

    async fn request(&self, method: Method, path: &str, body: Option<String>) -> Result<String> {
        let url = format!("{}/netcenter/rest{}", self.base_url, path);
        tracing::debug!("[Netcenter] {} {}", method, url);

        let mut req = self
            .http
            .request(method.clone(), &url)
            .basic_auth(&self.user, Some(&self.password))
            .header(reqwest::header::CONTENT_TYPE, "text/xml");
        if let Some(body) = body {
            req = req.body(body);
        }

        let res = req.send().await?;
        let status = res.status();
        let text = res.text().await?;

        if let Some(messages) = xml::embedded_errors(&text) {
            return Err(NetcenterError::Rejected(messages.join("; ")));
        }
        if !status.is_success() {
            return Err(NetcenterError::Status {
                method: method.to_string(),
                url,
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(text)
    }
}

fn parse_ip<T: std::str::FromStr>(s: &str) -> Result<T> {
    s.trim()
        .parse()
        .map_err(|_| NetcenterError::InvalidAddress(s.to_string()))
}
