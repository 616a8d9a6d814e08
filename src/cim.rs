//! Minimal CIM-XML over HTTP client: just the two operations this tool
//! needs (`InvokeMethod` on a class, `GetInstance` on an instance path),
//! plus the value and reference types they exchange.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::{MigrateError, Result};

/// Default CIMOM listener port; host URLs carry only the hostname downstream.
pub const DEFAULT_CIMOM_PORT: u16 = 5988;

/// Keyed reference to a CIM instance: class name plus keybindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CimInstanceName {
    pub class_name: String,
    pub keybindings: Vec<(String, String)>,
}

impl CimInstanceName {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            keybindings: Vec::new(),
        }
    }

    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.keybindings.push((name.into(), value.into()));
        self
    }

    pub fn key(&self, name: &str) -> Option<&str> {
        self.keybindings
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Typed CIM property value, restricted to what this tool consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum CimValue {
    Boolean(bool),
    Number(i64),
    String(String),
    Reference(CimInstanceName),
}

impl CimValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CimValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            CimValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CimValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&CimInstanceName> {
        match self {
            CimValue::Reference(path) => Some(path),
            _ => None,
        }
    }
}

/// Input parameter for an extrinsic method call.
#[derive(Debug, Clone)]
pub enum MethodParam {
    String(&'static str, String),
    Reference(&'static str, CimInstanceName),
}

impl MethodParam {
    pub fn name(&self) -> &'static str {
        match self {
            MethodParam::String(name, _) | MethodParam::Reference(name, _) => name,
        }
    }
}

/// A fetched CIM instance: class name plus property map.
#[derive(Debug, Clone, Default)]
pub struct CimInstance {
    pub class_name: String,
    pub properties: HashMap<String, CimValue>,
}

impl CimInstance {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: CimValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn property(&self, name: &str) -> Option<&CimValue> {
        self.properties.get(name)
    }
}

/// Result of an extrinsic method call: the method return value plus any
/// output parameters the provider filled in.
#[derive(Debug, Clone, Default)]
pub struct MethodResponse {
    pub return_value: Option<CimValue>,
    pub out_params: HashMap<String, CimValue>,
}

impl MethodResponse {
    pub fn with_out_param(mut self, name: impl Into<String>, value: CimValue) -> Self {
        self.out_params.insert(name.into(), value);
        self
    }

    pub fn out_param(&self, name: &str) -> Option<&CimValue> {
        self.out_params.get(name)
    }
}

/// Seam between the migration call sequence and the wire client, so the
/// sequence can be exercised against a scripted transport.
pub trait CimClient {
    fn invoke_method(
        &self,
        method: &str,
        class_name: &str,
        params: &[MethodParam],
    ) -> Result<MethodResponse>;

    fn get_instance(&self, path: &CimInstanceName) -> Result<CimInstance>;
}

/// Blocking CIM-XML connection to one CIMOM endpoint.
pub struct CimConnection {
    url: String,
    namespace: String,
    credentials: Option<(String, String)>,
    http: reqwest::blocking::Client,
    message_id: AtomicU64,
}

impl CimConnection {
    pub fn new(
        host: &str,
        namespace: &str,
        user: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            url: format!("http://{}:{}/cimom", host, DEFAULT_CIMOM_PORT),
            namespace: namespace.to_string(),
            credentials: user.map(|u| (u, password.unwrap_or_default())),
            http: reqwest::blocking::Client::new(),
            message_id: AtomicU64::new(1),
        }
    }

    fn post(&self, method: &str, object: &str, body: String) -> Result<String> {
        trace!(%object, %method, "CIM-XML request:\n{}", body);

        let mut request = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/xml; charset=utf-8")
            .header("CIMOperation", "MethodCall")
            .header("CIMMethod", method)
            .header("CIMObject", object)
            .body(body);

        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send()?.error_for_status()?;
        let text = response.text()?;
        trace!("CIM-XML response:\n{}", text);
        Ok(text)
    }

    fn next_message_id(&self) -> u64 {
        self.message_id.fetch_add(1, Ordering::Relaxed)
    }

    fn namespace_path_xml(&self) -> String {
        self.namespace
            .split('/')
            .map(|part| format!("<NAMESPACE NAME=\"{}\"/>", xml_escape(part)))
            .collect()
    }

    fn method_call_body(&self, method: &str, class_name: &str, params: &[MethodParam]) -> String {
        let mut body = String::new();
        body.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        body.push_str("<CIM CIMVERSION=\"2.0\" DTDVERSION=\"2.0\">");
        body.push_str(&format!(
            "<MESSAGE ID=\"{}\" PROTOCOLVERSION=\"1.0\"><SIMPLEREQ>",
            self.next_message_id()
        ));
        body.push_str(&format!("<METHODCALL NAME=\"{}\">", xml_escape(method)));
        body.push_str(&format!(
            "<LOCALCLASSPATH><LOCALNAMESPACEPATH>{}</LOCALNAMESPACEPATH>\
             <CLASSNAME NAME=\"{}\"/></LOCALCLASSPATH>",
            self.namespace_path_xml(),
            xml_escape(class_name)
        ));
        for param in params {
            match param {
                MethodParam::String(name, value) => body.push_str(&format!(
                    "<PARAMVALUE NAME=\"{}\" PARAMTYPE=\"string\"><VALUE>{}</VALUE></PARAMVALUE>",
                    xml_escape(name),
                    xml_escape(value)
                )),
                MethodParam::Reference(name, path) => body.push_str(&format!(
                    "<PARAMVALUE NAME=\"{}\" PARAMTYPE=\"reference\">\
                     <VALUE.REFERENCE>{}</VALUE.REFERENCE></PARAMVALUE>",
                    xml_escape(name),
                    instance_name_xml(path)
                )),
            }
        }
        body.push_str("</METHODCALL></SIMPLEREQ></MESSAGE></CIM>");
        body
    }

    fn get_instance_body(&self, path: &CimInstanceName) -> String {
        let mut body = String::new();
        body.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        body.push_str("<CIM CIMVERSION=\"2.0\" DTDVERSION=\"2.0\">");
        body.push_str(&format!(
            "<MESSAGE ID=\"{}\" PROTOCOLVERSION=\"1.0\"><SIMPLEREQ>",
            self.next_message_id()
        ));
        body.push_str("<IMETHODCALL NAME=\"GetInstance\">");
        body.push_str(&format!(
            "<LOCALNAMESPACEPATH>{}</LOCALNAMESPACEPATH>",
            self.namespace_path_xml()
        ));
        body.push_str(&format!(
            "<IPARAMVALUE NAME=\"InstanceName\">{}</IPARAMVALUE>",
            instance_name_xml(path)
        ));
        body.push_str("</IMETHODCALL></SIMPLEREQ></MESSAGE></CIM>");
        body
    }
}

impl CimClient for CimConnection {
    fn invoke_method(
        &self,
        method: &str,
        class_name: &str,
        params: &[MethodParam],
    ) -> Result<MethodResponse> {
        debug!(method, class_name, "invoking extrinsic method");
        let object = format!("{}:{}", self.namespace, class_name);
        let body = self.method_call_body(method, class_name, params);
        let response = self.post(method, &object, body)?;
        parse_method_response(&response)
    }

    fn get_instance(&self, path: &CimInstanceName) -> Result<CimInstance> {
        debug!(class_name = %path.class_name, "fetching instance");
        let body = self.get_instance_body(path);
        let response = self.post("GetInstance", &self.namespace, body)?;
        parse_get_instance_response(&response)
    }
}

fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn instance_name_xml(path: &CimInstanceName) -> String {
    let mut out = format!(
        "<INSTANCENAME CLASSNAME=\"{}\">",
        xml_escape(&path.class_name)
    );
    for (name, value) in &path.keybindings {
        out.push_str(&format!(
            "<KEYBINDING NAME=\"{}\"><KEYVALUE VALUETYPE=\"string\">{}</KEYVALUE></KEYBINDING>",
            xml_escape(name),
            xml_escape(value)
        ));
    }
    out.push_str("</INSTANCENAME>");
    out
}

/// Parse the response to an extrinsic method call. A CIM `ERROR` element
/// anywhere in the message wins over any payload.
pub fn parse_method_response(xml: &str) -> Result<MethodResponse> {
    let doc = parse_document(xml)?;
    check_cim_error(&doc)?;

    let mut response = MethodResponse::default();

    if let Some(node) = doc
        .descendants()
        .find(|n| n.has_tag_name("RETURNVALUE"))
    {
        response.return_value = parse_value_node(node);
    }

    for node in doc.descendants().filter(|n| n.has_tag_name("PARAMVALUE")) {
        let Some(name) = node.attribute("NAME") else {
            continue;
        };
        if let Some(value) = parse_value_node(node) {
            response.out_params.insert(name.to_string(), value);
        }
    }

    Ok(response)
}

/// Parse the response to a `GetInstance` intrinsic call.
pub fn parse_get_instance_response(xml: &str) -> Result<CimInstance> {
    let doc = parse_document(xml)?;
    check_cim_error(&doc)?;

    let instance_node = doc
        .descendants()
        .find(|n| n.has_tag_name("INSTANCE"))
        .ok_or_else(|| MigrateError::MalformedResponse("no INSTANCE element".to_string()))?;

    let mut instance = CimInstance::new(instance_node.attribute("CLASSNAME").unwrap_or_default());

    for property in instance_node
        .children()
        .filter(|n| n.has_tag_name("PROPERTY") || n.has_tag_name("PROPERTY.REFERENCE"))
    {
        let Some(name) = property.attribute("NAME") else {
            continue;
        };
        if let Some(value) = parse_value_node(property) {
            instance.properties.insert(name.to_string(), value);
        }
    }

    Ok(instance)
}

fn parse_document(xml: &str) -> Result<roxmltree::Document<'_>> {
    roxmltree::Document::parse(xml).map_err(|err| MigrateError::MalformedResponse(err.to_string()))
}

fn check_cim_error(doc: &roxmltree::Document<'_>) -> Result<()> {
    if let Some(node) = doc.descendants().find(|n| n.has_tag_name("ERROR")) {
        let code = node
            .attribute("CODE")
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let description = node.attribute("DESCRIPTION").unwrap_or_default().to_string();
        return Err(MigrateError::Cim { code, description });
    }
    Ok(())
}

/// Extract a typed value from a PARAMVALUE/RETURNVALUE/PROPERTY node.
fn parse_value_node(node: roxmltree::Node<'_, '_>) -> Option<CimValue> {
    let declared_type = node.attribute("PARAMTYPE").or_else(|| node.attribute("TYPE"));

    for child in node.children().filter(|c| c.is_element()) {
        match child.tag_name().name() {
            "VALUE" => {
                let text = child.text().unwrap_or("").trim();
                return Some(typed_value(text, declared_type));
            }
            "VALUE.REFERENCE" => {
                return parse_instance_name(child).map(CimValue::Reference);
            }
            _ => {}
        }
    }
    None
}

fn typed_value(text: &str, declared_type: Option<&str>) -> CimValue {
    match declared_type {
        Some("boolean") => CimValue::Boolean(text.eq_ignore_ascii_case("true")),
        Some(t) if t.starts_with("uint") || t.starts_with("sint") => text
            .parse()
            .map(CimValue::Number)
            .unwrap_or_else(|_| CimValue::String(text.to_string())),
        Some(_) => CimValue::String(text.to_string()),
        // Untyped values: some providers omit the type attribute, so
        // recognize the boolean literals they emit.
        None if text.eq_ignore_ascii_case("true") => CimValue::Boolean(true),
        None if text.eq_ignore_ascii_case("false") => CimValue::Boolean(false),
        None => CimValue::String(text.to_string()),
    }
}

fn parse_instance_name(node: roxmltree::Node<'_, '_>) -> Option<CimInstanceName> {
    let name_node = node
        .descendants()
        .find(|n| n.has_tag_name("INSTANCENAME"))?;

    let mut path = CimInstanceName::new(name_node.attribute("CLASSNAME")?);
    for binding in name_node
        .children()
        .filter(|n| n.has_tag_name("KEYBINDING"))
    {
        let Some(name) = binding.attribute("NAME") else {
            continue;
        };
        let value = binding
            .children()
            .find(|n| n.has_tag_name("KEYVALUE"))
            .and_then(|n| n.text())
            .unwrap_or("");
        path = path.with_key(name, value);
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_boolean_out_param() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<CIM CIMVERSION="2.0" DTDVERSION="2.0">
 <MESSAGE ID="42" PROTOCOLVERSION="1.0"><SIMPLERSP>
  <METHODRESPONSE NAME="CheckVirtualSystemIsMigratableToHost">
   <RETURNVALUE PARAMTYPE="uint32"><VALUE>0</VALUE></RETURNVALUE>
   <PARAMVALUE NAME="IsMigratable" PARAMTYPE="boolean"><VALUE>TRUE</VALUE></PARAMVALUE>
  </METHODRESPONSE>
 </SIMPLERSP></MESSAGE></CIM>"#;

        let response = parse_method_response(xml).unwrap();
        assert_eq!(response.return_value, Some(CimValue::Number(0)));
        assert_eq!(
            response.out_param("IsMigratable"),
            Some(&CimValue::Boolean(true))
        );
    }

    #[test]
    fn parses_job_reference_out_param() {
        let xml = r#"<CIM CIMVERSION="2.0" DTDVERSION="2.0">
 <MESSAGE ID="1" PROTOCOLVERSION="1.0"><SIMPLERSP>
  <METHODRESPONSE NAME="MigrateVirtualSystemToHost">
   <PARAMVALUE NAME="Job" PARAMTYPE="reference"><VALUE.REFERENCE>
    <INSTANCENAME CLASSNAME="Xen_MigrationJob">
     <KEYBINDING NAME="InstanceID"><KEYVALUE VALUETYPE="string">job-17</KEYVALUE></KEYBINDING>
    </INSTANCENAME>
   </VALUE.REFERENCE></PARAMVALUE>
  </METHODRESPONSE>
 </SIMPLERSP></MESSAGE></CIM>"#;

        let response = parse_method_response(xml).unwrap();
        let job = response
            .out_param("Job")
            .and_then(CimValue::as_reference)
            .unwrap();
        assert_eq!(job.class_name, "Xen_MigrationJob");
        assert_eq!(job.key("InstanceID"), Some("job-17"));
    }

    #[test]
    fn surfaces_cim_error_with_code_and_description() {
        let xml = r#"<CIM CIMVERSION="2.0" DTDVERSION="2.0">
 <MESSAGE ID="1" PROTOCOLVERSION="1.0"><SIMPLERSP>
  <METHODRESPONSE NAME="MigrateVirtualSystemToHost">
   <ERROR CODE="7" DESCRIPTION="CIM_ERR_NOT_SUPPORTED"/>
  </METHODRESPONSE>
 </SIMPLERSP></MESSAGE></CIM>"#;

        match parse_method_response(xml) {
            Err(MigrateError::Cim { code, description }) => {
                assert_eq!(code, 7);
                assert_eq!(description, "CIM_ERR_NOT_SUPPORTED");
            }
            other => panic!("expected CIM error, got {:?}", other),
        }
    }

    #[test]
    fn parses_job_instance_properties() {
        let xml = r#"<CIM CIMVERSION="2.0" DTDVERSION="2.0">
 <MESSAGE ID="3" PROTOCOLVERSION="1.0"><SIMPLERSP>
  <IMETHODRESPONSE NAME="GetInstance"><IRETURNVALUE>
   <INSTANCE CLASSNAME="Xen_MigrationJob">
    <PROPERTY NAME="JobState" TYPE="uint16"><VALUE>7</VALUE></PROPERTY>
    <PROPERTY NAME="Status" TYPE="string"><VALUE>Completed</VALUE></PROPERTY>
   </INSTANCE>
  </IRETURNVALUE></IMETHODRESPONSE>
 </SIMPLERSP></MESSAGE></CIM>"#;

        let instance = parse_get_instance_response(xml).unwrap();
        assert_eq!(instance.class_name, "Xen_MigrationJob");
        assert_eq!(
            instance.property("JobState").and_then(CimValue::as_number),
            Some(7)
        );
        assert_eq!(
            instance.property("Status").and_then(CimValue::as_str),
            Some("Completed")
        );
    }

    #[test]
    fn get_instance_without_payload_is_malformed() {
        let xml = r#"<CIM CIMVERSION="2.0" DTDVERSION="2.0">
 <MESSAGE ID="3" PROTOCOLVERSION="1.0"><SIMPLERSP>
  <IMETHODRESPONSE NAME="GetInstance"><IRETURNVALUE/></IMETHODRESPONSE>
 </SIMPLERSP></MESSAGE></CIM>"#;

        assert!(matches!(
            parse_get_instance_response(xml),
            Err(MigrateError::MalformedResponse(_))
        ));
    }

    #[test]
    fn untyped_boolean_literals_are_recognized() {
        assert_eq!(typed_value("true", None), CimValue::Boolean(true));
        assert_eq!(typed_value("FALSE", None), CimValue::Boolean(false));
        assert_eq!(
            typed_value("Completed", None),
            CimValue::String("Completed".to_string())
        );
    }

    #[test]
    fn request_body_carries_reference_and_string_params() {
        let conn = CimConnection::new("localhost", "root/virt", None, None);
        let guest = CimInstanceName::new("Xen_ComputerSystem")
            .with_key("Name", "myvm1")
            .with_key("CreationClassName", "Xen_ComputerSystem");

        let body = conn.method_call_body(
            "CheckVirtualSystemIsMigratableToHost",
            "Xen_VirtualSystemMigrationService",
            &[
                MethodParam::Reference("ComputerSystem", guest),
                MethodParam::String("DestinationHost", "target.example.com".to_string()),
            ],
        );

        assert!(body.contains("<METHODCALL NAME=\"CheckVirtualSystemIsMigratableToHost\">"));
        assert!(body.contains("<CLASSNAME NAME=\"Xen_VirtualSystemMigrationService\"/>"));
        assert!(body.contains("<INSTANCENAME CLASSNAME=\"Xen_ComputerSystem\">"));
        assert!(body.contains("<KEYVALUE VALUETYPE=\"string\">myvm1</KEYVALUE>"));
        assert!(body.contains("<PARAMVALUE NAME=\"DestinationHost\" PARAMTYPE=\"string\">"));
        assert!(body.contains("<NAMESPACE NAME=\"root\"/><NAMESPACE NAME=\"virt\"/>"));
    }

    #[test]
    fn xml_escape_covers_reserved_characters() {
        assert_eq!(xml_escape("a<b>&\"'"), "a&lt;b&gt;&amp;&quot;&apos;");
    }
}
