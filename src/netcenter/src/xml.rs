//! Netcenter XML wire types.
//!
//! Netcenter answers with small flat documents (`<freeIps><freeIp>..`) and
//! reports failures with an `<errors><error><msg>` block that may arrive with
//! any HTTP status.

use crate::error::{NetcenterError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeIpv4 {
    pub ip: String,
    #[serde(default)]
    pub ip_subnet: String,
    #[serde(default)]
    pub ip_mask: Option<u8>,
    #[serde(default)]
    pub subnet_and_mask: String,
    #[serde(default)]
    pub subnet_name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct FreeIpv4List {
    #[serde(rename = "freeIp", default)]
    pub entries: Vec<FreeIpv4>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeIpv6 {
    pub ipv6: String,
    #[serde(default)]
    pub ipv6_subnet: String,
    #[serde(default)]
    pub prefix: Option<u8>,
    #[serde(default)]
    pub subnet_and_prefix: String,
    #[serde(default)]
    pub subnet_name: String,
    #[serde(default)]
    pub subnet_type: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct FreeIpv6List {
    #[serde(rename = "freeIpV6", default)]
    pub entries: Vec<FreeIpv6>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsedIpv4 {
    pub ip: String,
    #[serde(alias = "fqName", default)]
    pub fqname: String,
    #[serde(rename = "ipSubnet", default)]
    pub ip_subnet: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UsedIpv4List {
    #[serde(rename = "usedIp", default)]
    pub entries: Vec<UsedIpv4>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsedIpv6 {
    pub ipv6: String,
    #[serde(alias = "fqName", default)]
    pub fqname: String,
    #[serde(rename = "ipv6Subnet", default)]
    pub ipv6_subnet: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UsedIpv6List {
    #[serde(rename = "usedIpV6", default)]
    pub entries: Vec<UsedIpv6>,
}

/// `POST nameToIP` body.
#[derive(Debug, Serialize)]
#[serde(rename = "insert")]
pub struct InsertRequest {
    #[serde(rename = "nameToIP")]
    pub name_to_ip: NameToIp,
}

#[derive(Debug, Serialize)]
pub struct NameToIp {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    pub reverse: String,
    #[serde(rename = "isgGroup")]
    pub isg_group: String,
    #[serde(rename = "fqName")]
    pub fq_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorList {
    #[serde(rename = "error", default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEntry {
    #[serde(default)]
    msg: String,
}

pub fn from_xml<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    quick_xml::de::from_str(body).map_err(|e| NetcenterError::Xml(e.to_string()))
}

pub fn to_xml<T: Serialize>(value: &T) -> Result<String> {
    quick_xml::se::to_string(value).map_err(|e| NetcenterError::Xml(e.to_string()))
}

/// Messages of an embedded `<errors>` block, if the body carries one.
pub fn embedded_errors(body: &str) -> Option<Vec<String>> {
    let start = body.find("<errors")?;
    let end = body[start..]
        .find("</errors>")
        .map(|i| start + i + "</errors>".len())
        .unwrap_or(body.len());

    let messages = match quick_xml::de::from_str::<ErrorList>(&body[start..end]) {
        Ok(list) => list
            .errors
            .into_iter()
            .map(|e| e.msg.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>(),
        Err(_) => Vec::new(),
    };

    if messages.is_empty() {
        Some(vec![body[start..end].trim().to_string()])
    } else {
        Some(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_free_ipv4s() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<freeIps>
  <freeIp><ip>192.33.91.17</ip><ipSubnet>192.33.91.0</ipSubnet><ipMask>24</ipMask><subnetAndMask>192.33.91.0/24</subnetAndMask><subnetName>vm</subnetName></freeIp>
  <freeIp><ip>192.33.91.18</ip><ipSubnet>192.33.91.0</ipSubnet><ipMask>24</ipMask><subnetAndMask>192.33.91.0/24</subnetAndMask><subnetName>vm</subnetName></freeIp>
</freeIps>"#;
        let list: FreeIpv4List = from_xml(body).unwrap();
        assert_eq!(list.entries.len(), 2);
        assert_eq!(list.entries[0].ip, "192.33.91.17");
        assert_eq!(list.entries[0].ip_mask, Some(24));
    }

    #[test]
    fn test_parse_empty_list() {
        let list: FreeIpv6List = from_xml("<freeIpV6s></freeIpV6s>").unwrap();
        assert!(list.entries.is_empty());
    }

    #[test]
    fn test_insert_body() {
        let req = InsertRequest {
            name_to_ip: NameToIp {
                ip: None,
                ipv6: Some("2001:67c:10ec:49c3::21".to_string()),
                reverse: "Y".to_string(),
                isg_group: "adm-soseth".to_string(),
                fq_name: "testvm.vsos.ethz.ch".to_string(),
            },
        };
        let xml = to_xml(&req).unwrap();
        assert_eq!(
            xml,
            "<insert><nameToIP><ipv6>2001:67c:10ec:49c3::21</ipv6><reverse>Y</reverse>\
             <isgGroup>adm-soseth</isgGroup><fqName>testvm.vsos.ethz.ch</fqName></nameToIP></insert>"
        );
    }

    #[test]
    fn test_embedded_errors() {
        let body = "<result><errors><error><msg>IP already in use</msg></error></errors></result>";
        assert_eq!(
            embedded_errors(body),
            Some(vec!["IP already in use".to_string()])
        );
        assert_eq!(embedded_errors("<success/>"), None);
    }
}
