//! Minimal XML-RPC encoding and decoding for the management API.
//!
//! Only the value shapes the management API actually produces are handled:
//! strings (typed, untyped and dateTime), booleans, integers, doubles,
//! arrays and structs. Everything the backup engine does not interpret
//! stays a string.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Error, Result};

/// A dynamically typed XML-RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Bool(bool),
    Int(i64),
    Double(f64),
    /// A `dateTime.iso8601` scalar, kept as its textual form (the format is
    /// lexicographically sortable).
    DateTime(String),
    Array(Vec<Value>),
    Struct(Vec<(String, Value)>),
}

impl Value {
    /// The textual content of a string-like value.
    pub fn text(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::DateTime(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a struct member by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(members) => members
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    pub(crate) fn expect_text(&self) -> Result<String> {
        self.text()
            .map(str::to_string)
            .ok_or_else(|| Error::Api(format!("expected a string, got {self:?}")))
    }

    pub(crate) fn expect_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::String(s) if s == "true" => Ok(true),
            Value::String(s) if s == "false" => Ok(false),
            other => Err(Error::Api(format!("expected a boolean, got {other:?}"))),
        }
    }

    pub(crate) fn expect_array(&self) -> Result<&[Value]> {
        match self {
            Value::Array(items) => Ok(items),
            other => Err(Error::Api(format!("expected an array, got {other:?}"))),
        }
    }

    pub(crate) fn expect_field(&self, name: &str) -> Result<&Value> {
        self.field(name)
            .ok_or_else(|| Error::Api(format!("response lacks the '{name}' field")))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Encode one method call document.
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("<?xml version=\"1.0\"?><methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        encode_value(param, &mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

fn encode_value(value: &Value, out: &mut String) {
    out.push_str("<value>");
    match value {
        Value::String(s) => {
            out.push_str("<string>");
            out.push_str(&escape(s.as_str()));
            out.push_str("</string>");
        }
        Value::Bool(b) => {
            out.push_str("<boolean>");
            out.push_str(if *b { "1" } else { "0" });
            out.push_str("</boolean>");
        }
        Value::Int(i) => {
            out.push_str("<int>");
            out.push_str(&i.to_string());
            out.push_str("</int>");
        }
        Value::Double(d) => {
            out.push_str("<double>");
            out.push_str(&d.to_string());
            out.push_str("</double>");
        }
        Value::DateTime(s) => {
            out.push_str("<dateTime.iso8601>");
            out.push_str(&escape(s.as_str()));
            out.push_str("</dateTime.iso8601>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                encode_value(item, out);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                out.push_str("<member><name>");
                out.push_str(&escape(name.as_str()));
                out.push_str("</name>");
                encode_value(member, out);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

/// Parse a method response document and return the single parameter value.
/// A `<fault>` response surfaces as [`Error::Api`].
pub fn parse_response(xml: &str) -> Result<Value> {
    let mut parser = Parser::new(xml);
    loop {
        match parser.next_event()? {
            Event::Start(tag) => match tag.name().as_ref() {
                b"methodResponse" | b"params" | b"param" => continue,
                b"value" => return parser.parse_value(),
                b"fault" => {
                    parser.expect_start(b"value")?;
                    let fault = parser.parse_value()?;
                    return Err(Error::Api(format!("XML-RPC fault: {fault:?}")));
                }
                other => {
                    return Err(Error::Api(format!(
                        "unexpected element <{}> in method response",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::Eof => return Err(Error::Api("empty method response".to_string())),
            _ => continue,
        }
    }
}

/// Extract the text of the single `<value>` element of an XML document, as
/// produced by asynchronous task results.
pub fn value_text(xml: &str) -> Result<String> {
    let mut parser = Parser::new(xml);
    loop {
        match parser.next_event()? {
            Event::Start(tag) if tag.name().as_ref() == b"value" => {
                return parser.read_text(b"value");
            }
            Event::Eof => {
                return Err(Error::Api("task result carries no <value>".to_string()))
            }
            _ => continue,
        }
    }
}

struct Parser<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> Parser<'a> {
    fn new(xml: &'a str) -> Self {
        let mut reader = Reader::from_reader(xml.as_bytes());
        let config = reader.config_mut();
        config.trim_text(true);
        config.expand_empty_elements = true;
        Self { reader }
    }

    fn next_event(&mut self) -> Result<Event<'a>> {
        self.reader
            .read_event()
            .map_err(|err| Error::Api(format!("malformed XML: {err}")))
    }

    fn expect_start(&mut self, name: &[u8]) -> Result<()> {
        loop {
            match self.next_event()? {
                Event::Start(tag) if tag.name().as_ref() == name => return Ok(()),
                Event::Eof => {
                    return Err(Error::Api(format!(
                        "missing <{}> element",
                        String::from_utf8_lossy(name)
                    )))
                }
                _ => continue,
            }
        }
    }

    fn expect_end(&mut self, name: &[u8]) -> Result<()> {
        loop {
            match self.next_event()? {
                Event::End(tag) if tag.name().as_ref() == name => return Ok(()),
                Event::Eof => {
                    return Err(Error::Api(format!(
                        "missing </{}> element",
                        String::from_utf8_lossy(name)
                    )))
                }
                _ => continue,
            }
        }
    }

    /// Accumulate text until the closing tag with the given name.
    fn read_text(&mut self, until: &[u8]) -> Result<String> {
        let mut text = String::new();
        loop {
            match self.next_event()? {
                Event::Text(t) => {
                    let fragment = t
                        .unescape()
                        .map_err(|err| Error::Api(format!("malformed XML text: {err}")))?;
                    text.push_str(&fragment);
                }
                Event::End(tag) if tag.name().as_ref() == until => return Ok(text),
                Event::Eof => {
                    return Err(Error::Api(format!(
                        "unterminated <{}> element",
                        String::from_utf8_lossy(until)
                    )))
                }
                _ => continue,
            }
        }
    }

    /// Parse the contents of a `<value>` element; the start tag has already
    /// been consumed.
    fn parse_value(&mut self) -> Result<Value> {
        match self.next_event()? {
            // an untyped value is a string
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|err| Error::Api(format!("malformed XML text: {err}")))?
                    .into_owned();
                self.expect_end(b"value")?;
                Ok(Value::String(text))
            }
            Event::End(tag) if tag.name().as_ref() == b"value" => {
                Ok(Value::String(String::new()))
            }
            Event::Start(tag) => {
                let value = match tag.name().as_ref() {
                    b"string" => Value::String(self.read_text(b"string")?),
                    b"boolean" => {
                        let text = self.read_text(b"boolean")?;
                        Value::Bool(text.trim() == "1")
                    }
                    b"int" => Value::Int(self.parse_int(b"int")?),
                    b"i4" => Value::Int(self.parse_int(b"i4")?),
                    b"i8" => Value::Int(self.parse_int(b"i8")?),
                    b"double" => {
                        let text = self.read_text(b"double")?;
                        let parsed = text.trim().parse().map_err(|_| {
                            Error::Api(format!("invalid double '{text}'"))
                        })?;
                        Value::Double(parsed)
                    }
                    b"dateTime.iso8601" => Value::DateTime(self.read_text(b"dateTime.iso8601")?),
                    b"array" => self.parse_array()?,
                    b"struct" => self.parse_struct()?,
                    b"nil" => {
                        self.expect_end(b"nil")?;
                        Value::String(String::new())
                    }
                    other => {
                        return Err(Error::Api(format!(
                            "unsupported XML-RPC type <{}>",
                            String::from_utf8_lossy(other)
                        )))
                    }
                };
                self.expect_end(b"value")?;
                Ok(value)
            }
            other => Err(Error::Api(format!("unexpected event in <value>: {other:?}"))),
        }
    }

    fn parse_int(&mut self, tag: &[u8]) -> Result<i64> {
        let text = self.read_text(tag)?;
        text.trim()
            .parse()
            .map_err(|_| Error::Api(format!("invalid integer '{text}'")))
    }

    fn parse_array(&mut self) -> Result<Value> {
        self.expect_start(b"data")?;
        let mut items = vec![];
        loop {
            match self.next_event()? {
                Event::Start(tag) if tag.name().as_ref() == b"value" => {
                    items.push(self.parse_value()?);
                }
                Event::End(tag) if tag.name().as_ref() == b"data" => break,
                Event::Eof => return Err(Error::Api("unterminated array".to_string())),
                _ => continue,
            }
        }
        self.expect_end(b"array")?;
        Ok(Value::Array(items))
    }

    fn parse_struct(&mut self) -> Result<Value> {
        let mut members = vec![];
        loop {
            match self.next_event()? {
                Event::Start(tag) if tag.name().as_ref() == b"member" => {
                    self.expect_start(b"name")?;
                    let name = self.read_text(b"name")?;
                    self.expect_start(b"value")?;
                    let value = self.parse_value()?;
                    self.expect_end(b"member")?;
                    members.push((name, value));
                }
                Event::End(tag) if tag.name().as_ref() == b"struct" => break,
                Event::Eof => return Err(Error::Api("unterminated struct".to_string())),
                _ => continue,
            }
        }
        Ok(Value::Struct(members))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_a_login_call() {
        let xml = encode_call(
            "session.login_with_password",
            &["root".into(), "pa<ss".into()],
        );
        assert!(xml.contains("<methodName>session.login_with_password</methodName>"));
        assert!(xml.contains("<value><string>root</string></value>"));
        assert!(xml.contains("<value><string>pa&lt;ss</string></value>"));
    }

    #[test]
    fn parses_a_success_envelope() {
        let xml = "<?xml version='1.0'?><methodResponse><params><param><value><struct>\
                   <member><name>Status</name><value>Success</value></member>\
                   <member><name>Value</name><value>OpaqueRef:abc</value></member>\
                   </struct></value></param></params></methodResponse>";
        let value = parse_response(xml).unwrap();
        assert_eq!(
            value.field("Status").and_then(Value::text),
            Some("Success")
        );
        assert_eq!(
            value.field("Value").and_then(Value::text),
            Some("OpaqueRef:abc")
        );
    }

    #[test]
    fn parses_typed_scalars_and_arrays() {
        let xml = "<methodResponse><params><param><value><struct>\
                   <member><name>Value</name><value><array><data>\
                   <value><boolean>1</boolean></value>\
                   <value><int>42</int></value>\
                   <value><string>text</string></value>\
                   <value><dateTime.iso8601>20260801T09:00:00Z</dateTime.iso8601></value>\
                   </data></array></value></member>\
                   </struct></value></param></params></methodResponse>";
        let value = parse_response(xml).unwrap();
        let items = value.field("Value").unwrap().expect_array().unwrap();
        assert_eq!(items[0], Value::Bool(true));
        assert_eq!(items[1], Value::Int(42));
        assert_eq!(items[2], Value::String("text".to_string()));
        assert_eq!(
            items[3],
            Value::DateTime("20260801T09:00:00Z".to_string())
        );
    }

    #[test]
    fn parses_empty_values_and_structs() {
        let xml = "<methodResponse><params><param><value><struct>\
                   <member><name>Value</name><value></value></member>\
                   </struct></value></param></params></methodResponse>";
        let value = parse_response(xml).unwrap();
        assert_eq!(
            value.field("Value"),
            Some(&Value::String(String::new()))
        );
    }

    #[test]
    fn faults_surface_as_api_errors() {
        let xml = "<methodResponse><fault><value><struct>\
                   <member><name>faultCode</name><value><int>1</int></value></member>\
                   <member><name>faultString</name><value>broken</value></member>\
                   </struct></value></fault></methodResponse>";
        assert!(matches!(parse_response(xml), Err(Error::Api(_))));
    }

    #[test]
    fn encodes_nested_structs() {
        let record = Value::Struct(vec![
            ("SR".to_string(), "OpaqueRef:sr".into()),
            ("virtual_size".to_string(), "4000000".into()),
            ("read_only".to_string(), Value::Bool(false)),
        ]);
        let call = encode_call("VDI.create", &[record]);
        assert!(call.contains("<member><name>virtual_size</name><value><string>4000000</string></value></member>"));
        assert!(call.contains("<value><boolean>0</boolean></value>"));
    }

    #[test]
    fn extracts_task_result_value() {
        assert_eq!(
            value_text("<value>0cc175b9c0f1b6a831c399e269772661</value>").unwrap(),
            "0cc175b9c0f1b6a831c399e269772661"
        );
        assert!(value_text("<nothing/>").is_err());
    }
}
