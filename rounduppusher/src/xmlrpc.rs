//! XML-RPC encoding of method calls and decoding of method responses.

use std::collections::BTreeMap;

use base64::Engine;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Result, RoundupError};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Base64(Vec<u8>),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    /// Item ids come back as strings from Roundup, as integers elsewhere.
    pub fn as_id(&self) -> Option<String> {
        match self {
            Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Value::Int(id) => Some(id.to_string()),
            _ => None,
        }
    }
}

pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        encode_value(param, &mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>\n");
    out
}

fn encode_value(value: &Value, out: &mut String) {
    out.push_str("<value>");
    match value {
        Value::Nil => out.push_str("<nil/>"),
        Value::Bool(flag) => {
            out.push_str(if *flag {
                "<boolean>1</boolean>"
            } else {
                "<boolean>0</boolean>"
            });
        }
        Value::Int(number) => out.push_str(&format!("<int>{number}</int>")),
        Value::Double(number) => out.push_str(&format!("<double>{number}</double>")),
        Value::String(text) => {
            out.push_str("<string>");
            out.push_str(&escape(text.as_str()));
            out.push_str("</string>");
        }
        Value::Base64(bytes) => {
            out.push_str("<base64>");
            out.push_str(&base64::engine::general_purpose::STANDARD.encode(bytes));
            out.push_str("</base64>");
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

/// Decodes a `methodResponse`. A fault becomes [`RoundupError::Fault`].
pub fn decode_response(bytes: &[u8]) -> Result<Value> {
    let mut decoder = Decoder::new(bytes);
    decoder.expect_start("methodResponse")?;
    match decoder.next_tag()? {
        Tag::Start(tag) if tag == b"params" => {
            decoder.expect_start("param")?;
            decoder.expect_start("value")?;
            decoder.value()
        }
        Tag::Start(tag) if tag == b"fault" => {
            decoder.expect_start("value")?;
            Err(fault_error(decoder.value()?))
        }
        other => Err(unexpected("params", &other)),
    }
}

fn fault_error(fault: Value) -> RoundupError {
    let members = match fault {
        Value::Struct(members) => members,
        other => return RoundupError::Malformed(format!("fault is not a struct: {other:?}")),
    };
    let code = match members.get("faultCode") {
        Some(Value::Int(code)) => *code,
        _ => 0,
    };
    let message = members
        .get("faultString")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    RoundupError::Fault { code, message }
}

#[derive(Debug)]
enum Tag {
    Start(Vec<u8>),
    End(Vec<u8>),
    Empty(Vec<u8>),
    Text(String),
    Eof,
}

fn unexpected(wanted: &str, found: &Tag) -> RoundupError {
    let found = match found {
        Tag::Start(tag) => format!("<{}>", String::from_utf8_lossy(tag)),
        Tag::End(tag) => format!("</{}>", String::from_utf8_lossy(tag)),
        Tag::Empty(tag) => format!("<{}/>", String::from_utf8_lossy(tag)),
        Tag::Text(text) => format!("text '{}'", text.trim()),
        Tag::Eof => "end of document".to_string(),
    };
    RoundupError::Malformed(format!("expected {wanted}, found {found}"))
}

struct Decoder<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            reader: Reader::from_reader(bytes),
        }
    }

    /// Next element or text; declarations and comments are dropped.
    fn next_event(&mut self) -> Result<Tag> {
        loop {
            let tag = match self.reader.read_event()? {
                Event::Start(start) => Tag::Start(start.local_name().as_ref().to_vec()),
                Event::End(end) => Tag::End(end.local_name().as_ref().to_vec()),
                Event::Empty(empty) => Tag::Empty(empty.local_name().as_ref().to_vec()),
                Event::Text(text) => Tag::Text(
                    text.unescape()
                        .map_err(|err| RoundupError::Malformed(err.to_string()))?
                        .into_owned(),
                ),
                Event::CData(data) => {
                    Tag::Text(String::from_utf8_lossy(&data.into_inner()).into_owned())
                }
                Event::Eof => Tag::Eof,
                _ => continue,
            };
            return Ok(tag);
        }
    }

    /// Next element, skipping whitespace between elements.
    fn next_tag(&mut self) -> Result<Tag> {
        loop {
            match self.next_event()? {
                Tag::Text(text) if text.trim().is_empty() => continue,
                other => return Ok(other),
            }
        }
    }

    fn expect_start(&mut self, name: &str) -> Result<()> {
        match self.next_tag()? {
            Tag::Start(tag) if tag == name.as_bytes() => Ok(()),
            other => Err(unexpected(&format!("<{name}>"), &other)),
        }
    }

    fn expect_end(&mut self, name: &str) -> Result<()> {
        match self.next_tag()? {
            Tag::End(tag) if tag == name.as_bytes() => Ok(()),
            other => Err(unexpected(&format!("</{name}>"), &other)),
        }
    }

    /// Text content up to the end tag `name`.
    fn text_until(&mut self, name: &str) -> Result<String> {
        let mut text = String::new();
        loop {
            match self.next_event()? {
                Tag::Text(chunk) => text.push_str(&chunk),
                Tag::End(tag) if tag == name.as_bytes() => return Ok(text),
                other => return Err(unexpected(&format!("</{name}>"), &other)),
            }
        }
    }

    /// Content of a `<value>` whose start tag was just read, end tag included.
    /// Untyped content is a string.
    fn value(&mut self) -> Result<Value> {
        let mut untyped = String::new();
        loop {
            match self.next_event()? {
                Tag::Text(chunk) => untyped.push_str(&chunk),
                Tag::End(tag) if tag == b"value" => return Ok(Value::String(untyped)),
                Tag::Empty(tag) => {
                    let value = match tag.as_slice() {
                        b"nil" => Value::Nil,
                        b"base64" => Value::Base64(Vec::new()),
                        b"array" => Value::Array(Vec::new()),
                        b"struct" => Value::Struct(BTreeMap::new()),
                        _ => Value::String(String::new()),
                    };
                    self.expect_end("value")?;
                    return Ok(value);
                }
                Tag::Start(tag) => {
                    let value = self.typed(&tag)?;
                    self.expect_end("value")?;
                    return Ok(value);
                }
                other => return Err(unexpected("</value>", &other)),
            }
        }
    }

    fn typed(&mut self, tag: &[u8]) -> Result<Value> {
        let name = String::from_utf8_lossy(tag).into_owned();
        match tag {
            b"string" | b"dateTime.iso8601" => Ok(Value::String(self.text_until(&name)?)),
            b"int" | b"i4" | b"i8" => {
                let text = self.text_until(&name)?;
                text.trim()
                    .parse()
                    .map(Value::Int)
                    .map_err(|_| RoundupError::Malformed(format!("bad integer '{text}'")))
            }
            b"double" => {
                let text = self.text_until(&name)?;
                text.trim()
                    .parse()
                    .map(Value::Double)
                    .map_err(|_| RoundupError::Malformed(format!("bad double '{text}'")))
            }
            b"boolean" => match self.text_until(&name)?.trim() {
                "1" => Ok(Value::Bool(true)),
                "0" => Ok(Value::Bool(false)),
                other => Err(RoundupError::Malformed(format!("bad boolean '{other}'"))),
            },
            b"base64" => {
                let text = self.text_until(&name)?;
                let packed: String = text.split_whitespace().collect();
                Ok(Value::Base64(
                    base64::engine::general_purpose::STANDARD.decode(packed)?,
                ))
            }
            b"nil" => {
                self.expect_end("nil")?;
                Ok(Value::Nil)
            }
            b"array" => {
                let mut items = Vec::new();
                match self.next_tag()? {
                    Tag::Empty(data) if data == b"data" => {}
                    Tag::Start(data) if data == b"data" => loop {
                        match self.next_tag()? {
                            Tag::Start(item) if item == b"value" => items.push(self.value()?),
                            Tag::End(end) if end == b"data" => break,
                            other => return Err(unexpected("<value>", &other)),
                        }
                    },
                    other => return Err(unexpected("<data>", &other)),
                }
                self.expect_end("array")?;
                Ok(Value::Array(items))
            }
            b"struct" => {
                let mut members = BTreeMap::new();
                loop {
                    match self.next_tag()? {
                        Tag::Start(member) if member == b"member" => {
                            self.expect_start("name")?;
                            let key = self.text_until("name")?;
                            self.expect_start("value")?;
                            let value = self.value()?;
                            self.expect_end("member")?;
                            members.insert(key, value);
                        }
                        Tag::End(end) if end == b"struct" => break,
                        other => return Err(unexpected("<member>", &other)),
                    }
                }
                Ok(Value::Struct(members))
            }
            _ => Err(RoundupError::Malformed(format!(
                "unsupported value type <{name}>"
            ))),
        }
    }
}
