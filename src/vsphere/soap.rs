//! vSphere SOAP transport
//!
//! Wraps the `/sdk` endpoint: envelope construction, fault decoding and
//! the handful of response shapes the populator reads (managed object
//! references and property values).

use super::xml;
use crate::error::{Error, Result};
use std::time::Duration;
use tracing::debug;

const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

// =============================================================================
// Faults
// =============================================================================

/// Decoded SOAP fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    /// Fault type from the detail's `xsi:type`, or the fault code
    pub fault_type: String,
    pub message: String,
}

impl SoapFault {
    pub fn is_not_authenticated(&self) -> bool {
        self.fault_type == "NotAuthenticated"
    }

    /// Map a fault to the populator error it represents
    pub fn into_error(self, operation: &str) -> Error {
        match self.fault_type.as_str() {
            "InvalidLogin" | "NoPermission" | "NotAuthenticated" => Error::Authentication {
                system: "vcenter".into(),
                reason: format!("{}: {}", self.fault_type, self.message),
            },
            "ManagedObjectNotFound" => Error::ResourceNotFound {
                kind: "ManagedObject".into(),
                name: self.message,
            },
            _ => Error::Soap {
                operation: operation.to_string(),
                reason: format!("{}: {}", self.fault_type, self.message),
            },
        }
    }
}

/// Extract a SOAP fault from a response body, if present
pub fn parse_fault(body: &str) -> Option<SoapFault> {
    let doc = roxmltree::Document::parse(body).ok()?;
    let fault = doc.descendants().find(|n| {
        n.is_element()
            && n.tag_name().name() == "Fault"
            && n.tag_name().namespace() == Some(SOAP_ENV_NS)
    })?;

    let message = xml::child_text(fault, "faultstring").unwrap_or_default();
    let fault_type = xml::child(fault, "detail")
        .and_then(|d| xml::elements(d).next())
        .and_then(|n| xml::xsi_type(n).map(str::to_string).or_else(|| {
            Some(n.tag_name().name().trim_end_matches("Fault").to_string())
        }))
        .or_else(|| xml::child_text(fault, "faultcode"))
        .unwrap_or_else(|| "Unknown".to_string());

    Some(SoapFault {
        fault_type,
        message,
    })
}

// =============================================================================
// Transport
// =============================================================================

/// Raw SOAP transport bound to one vCenter
pub struct SoapClient {
    http: reqwest::Client,
    endpoint: String,
    soap_action: String,
}

impl SoapClient {
    /// Create a transport for `https://<hostname>/sdk`
    pub fn new(hostname: &str, insecure: bool, timeout: Duration, api_version: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(insecure)
            .timeout(timeout)
            .build()?;

        let endpoint = if hostname.starts_with("https://") || hostname.starts_with("http://") {
            format!("{}/sdk", hostname.trim_end_matches('/'))
        } else {
            format!("https://{}/sdk", hostname)
        };

        Ok(Self {
            http,
            endpoint,
            soap_action: format!("urn:vim25/{}", api_version),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Post `body` inside an envelope. Faults come back as `Ok(Err(fault))`.
    pub async fn invoke(
        &self,
        operation: &str,
        body: &str,
    ) -> Result<std::result::Result<String, SoapFault>> {
        debug!("SOAP {} -> {}", operation, self.endpoint);

        let response = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", &self.soap_action)
            .body(envelope(body))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if let Some(fault) = parse_fault(&text) {
            return Ok(Err(fault));
        }
        if !status.is_success() {
            return Err(Error::Soap {
                operation: operation.to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        Ok(Ok(text))
    }
}

/// Wrap a body in a SOAP envelope
pub fn envelope(body: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<soapenv:Envelope xmlns:soapenv="{}" "#,
            r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
            r#"xmlns:xsi="{}">"#,
            "<soapenv:Body>{}</soapenv:Body></soapenv:Envelope>"
        ),
        SOAP_ENV_NS,
        xml::XSI_NS,
        body
    )
}

/// `<_this type="T">moref</_this>`
pub fn this(kind: &str, moref: &str) -> String {
    format!(r#"<_this type="{}">{}</_this>"#, kind, xml::escape(moref))
}

// =============================================================================
// Response Readers
// =============================================================================

/// Managed object reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoRef {
    pub kind: String,
    pub value: String,
}

/// First `returnval` as a managed object reference
pub fn returnval_moref(body: &str) -> Result<Option<MoRef>> {
    let doc = roxmltree::Document::parse(body)?;
    let moref = xml::descendants_named(doc.root_element(), "returnval")
        .next()
        .map(|n| MoRef {
            kind: n.attribute("type").unwrap_or_default().to_string(),
            value: xml::text(n),
        })
        .filter(|m| !m.value.is_empty());
    Ok(moref)
}

/// Named child morefs of the first `returnval` (service content fields)
pub fn returnval_field(body: &str, field: &str) -> Result<Option<String>> {
    let doc = roxmltree::Document::parse(body)?;
    let value = xml::descendants_named(doc.root_element(), "returnval")
        .next()
        .and_then(|n| xml::child_text(n, field));
    Ok(value)
}

/// Value nodes of property `path` in a RetrievePropertiesEx response,
/// applied to `f` while the document is alive
fn with_property<T>(
    body: &str,
    path: &str,
    f: impl FnOnce(roxmltree::Node<'_, '_>) -> T,
) -> Result<Option<T>> {
    let doc = roxmltree::Document::parse(body)?;
    let val = xml::descendants_named(doc.root_element(), "propSet")
        .find(|p| xml::child_text(*p, "name").as_deref() == Some(path))
        .and_then(|p| xml::child(p, "val"));
    Ok(val.map(f))
}

/// Scalar property value (text or single moref)
pub fn property_text(body: &str, path: &str) -> Result<Option<String>> {
    Ok(with_property(body, path, xml::text)?.filter(|s| !s.is_empty()))
}

/// Single moref property value
pub fn property_moref(body: &str, path: &str) -> Result<Option<MoRef>> {
    Ok(with_property(body, path, |val| MoRef {
        kind: val.attribute("type").unwrap_or_default().to_string(),
        value: xml::text(val),
    })?
    .filter(|m| !m.value.is_empty()))
}

/// `ArrayOfManagedObjectReference` property value
pub fn property_morefs(body: &str, path: &str) -> Result<Vec<MoRef>> {
    Ok(with_property(body, path, |val| {
        xml::elements(val)
            .map(|n| MoRef {
                kind: n.attribute("type").unwrap_or_default().to_string(),
                value: xml::text(n),
            })
            .collect::<Vec<_>>()
    })?
    .unwrap_or_default())
}

/// Body of a single-object RetrievePropertiesEx call
pub fn retrieve_properties(collector: &str, obj: &MoRef, paths: &[&str]) -> String {
    let path_set: String = paths
        .iter()
        .map(|p| format!("<pathSet>{}</pathSet>", xml::escape(p)))
        .collect();
    format!(
        concat!(
            r#"<RetrievePropertiesEx xmlns="urn:vim25">{}"#,
            "<specSet><propSet><type>{}</type>{}</propSet>",
            r#"<objectSet><obj type="{}">{}</obj><skip>false</skip></objectSet></specSet>"#,
            "<options/></RetrievePropertiesEx>"
        ),
        this("PropertyCollector", collector),
        obj.kind,
        path_set,
        obj.kind,
        xml::escape(&obj.value)
    )
}
