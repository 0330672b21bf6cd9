//! OAI-PMH `ListRecords` response parsing.
//!
//! A response page is read in a single streaming pass with `quick-xml`,
//! collecting error elements, the resumption token, and record elements.
//! Precedence is applied afterwards by [`ListRecordsResponse::into_page`]:
//! an error element wins over everything else in the page.
//!
//! Namespaces are matched by local name, so both prefixed
//! (`<oai:record>`) and default-namespace documents are accepted.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

use crate::error::{HarvestError, ProtocolError, Result};
use crate::models::{parse_datestamp, RawRecord, RecordHeader};

/// Everything found in one response body, before precedence is applied.
#[derive(Debug, Default)]
pub struct ListRecordsResponse {
    /// Error elements in document order.
    pub errors: Vec<ProtocolError>,
    /// Non-empty resumption token, if any.
    pub resumption_token: Option<String>,
    /// Records in document order; header problems are per-record errors.
    pub records: Vec<Result<RawRecord>>,
    /// Set when the document broke off mid-way. Whatever was read before
    /// the fault is still returned.
    pub malformed: Option<String>,
}

/// A page that carried no protocol error.
#[derive(Debug, Default)]
pub struct Page {
    pub resumption_token: Option<String>,
    pub records: Vec<Result<RawRecord>>,
    /// Why the body stopped short of `</OAI-PMH>`, if it did. Without a
    /// token such a page cannot be taken as the last one.
    pub malformed: Option<String>,
}

impl ListRecordsResponse {
    /// Apply error precedence. The first error element is raised and none of
    /// the page's records are surfaced.
    pub fn into_page(self) -> Result<Page> {
        if let Some(first) = self.errors.into_iter().next() {
            return Err(HarvestError::Protocol(first));
        }
        Ok(Page {
            resumption_token: self.resumption_token,
            records: self.records,
            malformed: self.malformed,
        })
    }
}

#[derive(Default)]
struct RecordBuilder {
    identifier: Option<String>,
    datestamp: Option<String>,
    set_specs: Vec<String>,
    deleted: bool,
    metadata: Option<String>,
}

impl RecordBuilder {
    fn build(self) -> Result<RawRecord> {
        let identifier = self
            .identifier
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HarvestError::parse("<unknown>", "record header has no identifier"))?;

        let datestamp = match self.datestamp.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(parse_datestamp(raw).ok_or_else(|| {
                HarvestError::parse(&identifier, format!("invalid datestamp '{}'", raw))
            })?),
        };

        Ok(RawRecord {
            header: RecordHeader {
                identifier,
                datestamp,
                set_specs: self.set_specs,
                deleted: self.deleted,
            },
            metadata: self
                .metadata
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty()),
        })
    }
}

/// Parse a `ListRecords` response body.
///
/// # Errors
///
/// Returns [`HarvestError::Xml`] when the body is not an OAI-PMH document
/// at all (no `OAI-PMH` root element could be read). A document that
/// breaks off after the root element is recovered: the fault is recorded
/// in [`ListRecordsResponse::malformed`].
pub fn parse_list_records(xml: &str) -> Result<ListRecordsResponse> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut response = ListRecordsResponse::default();
    let mut saw_root = false;
    let mut root_closed = false;
    let mut current: Option<RecordBuilder> = None;
    let mut in_header = false;

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => {
                if !saw_root {
                    return Err(HarvestError::Xml(e.to_string()));
                }
                warn!(
                    position = reader.buffer_position() as u64,
                    error = %e,
                    "response broke off; keeping what was parsed"
                );
                response.malformed = Some(e.to_string());
                break;
            }
        };

        let step = match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"OAI-PMH" => {
                    saw_root = true;
                    Ok(())
                }
                b"error" => read_text(&mut reader).map(|text| {
                    response.errors.push(error_element(&e, text));
                }),
                b"resumptionToken" => read_text(&mut reader).map(|text| {
                    let token = text.trim();
                    if !token.is_empty() {
                        response.resumption_token = Some(token.to_string());
                    }
                }),
                b"record" => {
                    current = Some(RecordBuilder::default());
                    Ok(())
                }
                b"header" => {
                    if let Some(builder) = current.as_mut() {
                        in_header = true;
                        builder.deleted = is_deleted(&e);
                    }
                    Ok(())
                }
                b"identifier" if in_header => read_text(&mut reader).map(|text| {
                    if let Some(builder) = current.as_mut() {
                        builder.identifier = Some(text);
                    }
                }),
                b"datestamp" if in_header => read_text(&mut reader).map(|text| {
                    if let Some(builder) = current.as_mut() {
                        builder.datestamp = Some(text);
                    }
                }),
                b"setSpec" if in_header => read_text(&mut reader).map(|text| {
                    if let Some(builder) = current.as_mut() {
                        builder.set_specs.push(text.trim().to_string());
                    }
                }),
                b"metadata" if current.is_some() => {
                    let end = e.to_end().into_owned();
                    match reader.read_to_end(end.name()) {
                        Ok(span) => {
                            let fragment = &xml[span.start as usize..span.end as usize];
                            if let Some(builder) = current.as_mut() {
                                builder.metadata = Some(fragment.to_string());
                            }
                            Ok(())
                        }
                        Err(e) => Err(e.to_string()),
                    }
                }
                _ => Ok(()),
            },
            Event::Empty(e) => {
                match e.local_name().as_ref() {
                    b"OAI-PMH" => {
                        saw_root = true;
                        root_closed = true;
                    }
                    b"error" => response.errors.push(error_element(&e, String::new())),
                    b"header" => {
                        if let Some(builder) = current.as_mut() {
                            builder.deleted = is_deleted(&e);
                        }
                    }
                    _ => {}
                }
                Ok(())
            }
            Event::End(e) => {
                match e.local_name().as_ref() {
                    b"OAI-PMH" => root_closed = true,
                    b"header" => in_header = false,
                    b"record" => {
                        if let Some(builder) = current.take() {
                            response.records.push(builder.build());
                        }
                        in_header = false;
                    }
                    _ => {}
                }
                Ok(())
            }
            Event::Eof => break,
            _ => Ok(()),
        };

        if let Err(message) = step {
            if !saw_root {
                return Err(HarvestError::Xml(message));
            }
            warn!(error = %message, "response broke off; keeping what was parsed");
            response.malformed = Some(message);
            break;
        }
    }

    if !saw_root {
        return Err(HarvestError::Xml(
            "missing OAI-PMH root element".to_string(),
        ));
    }
    if !root_closed && response.malformed.is_none() {
        warn!("response ended before </OAI-PMH>; keeping what was parsed");
        response.malformed = Some("document ended before </OAI-PMH>".to_string());
    }

    Ok(response)
}

/// Read the text content of the element whose start tag was just consumed,
/// up to and including its end tag.
fn read_text(reader: &mut Reader<&[u8]>) -> std::result::Result<String, String> {
    let mut text = String::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Text(t) => {
                let unescaped = t.unescape().map_err(|e| e.to_string())?;
                text.push_str(&unescaped);
            }
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c.into_inner())),
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                if depth == 0 {
                    return Ok(text);
                }
                depth -= 1;
            }
            Event::Eof => return Err("unexpected end of document".to_string()),
            _ => {}
        }
    }
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

fn error_element(e: &BytesStart<'_>, description: String) -> ProtocolError {
    let code = attribute(e, "code").unwrap_or_else(|| "UNKNOWN".to_string());
    ProtocolError::new(&code, description.trim())
}

fn is_deleted(e: &BytesStart<'_>) -> bool {
    attribute(e, "status").as_deref() == Some("deleted")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OaiErrorCode;
    use chrono::{TimeZone, Utc};

    const PAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2021-03-04T05:06:07Z</responseDate>
  <request verb="ListRecords" metadataPrefix="oai_dc">https://example.org/oai</request>
  <ListRecords>
    <record>
      <header>
        <identifier>oai:example.org:1</identifier>
        <datestamp>2021-03-01T10:00:00Z</datestamp>
        <setSpec>IEDA</setSpec>
      </header>
      <metadata>
        <oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/">
          <dc:title>Core &amp; sample</dc:title>
        </oai_dc:dc>
      </metadata>
    </record>
    <record>
      <header status="deleted">
        <identifier>oai:example.org:2</identifier>
        <datestamp>2021-02-01</datestamp>
      </header>
    </record>
    <resumptionToken cursor="0" completeListSize="3">tok1</resumptionToken>
  </ListRecords>
</OAI-PMH>"#;

    #[test]
    fn parses_records_and_token() {
        let page = parse_list_records(PAGE).unwrap().into_page().unwrap();
        assert_eq!(page.resumption_token.as_deref(), Some("tok1"));
        assert_eq!(page.records.len(), 2);

        let first = page.records[0].as_ref().unwrap();
        assert_eq!(first.header.identifier, "oai:example.org:1");
        assert_eq!(
            first.header.datestamp,
            Some(Utc.with_ymd_and_hms(2021, 3, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(first.header.set_specs, vec!["IEDA".to_string()]);
        assert!(!first.header.deleted);
        let metadata = first.metadata.as_deref().unwrap();
        assert!(metadata.starts_with("<oai_dc:dc"));
        assert!(metadata.contains("Core &amp; sample"));

        let second = page.records[1].as_ref().unwrap();
        assert!(second.header.deleted);
        assert!(second.metadata.is_none());
    }

    #[test]
    fn error_takes_precedence_over_records() {
        let xml = r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <error code="badResumptionToken">expired</error>
  <error code="badArgument">second</error>
  <ListRecords>
    <record><header><identifier>a</identifier><datestamp>2021-01-01</datestamp></header></record>
    <resumptionToken>tok</resumptionToken>
  </ListRecords>
</OAI-PMH>"#;
        let response = parse_list_records(xml).unwrap();
        assert_eq!(response.errors.len(), 2);
        let err = response.into_page().unwrap_err();
        let protocol = err.protocol().unwrap();
        assert_eq!(protocol.code, OaiErrorCode::BadResumptionToken);
        assert_eq!(protocol.description, "expired");
    }

    #[test]
    fn empty_resumption_token_ends_list() {
        let xml = r#"<OAI-PMH><ListRecords>
  <record><header><identifier>a</identifier></header><metadata><x/></metadata></record>
  <resumptionToken completeListSize="1" cursor="0"/>
</ListRecords></OAI-PMH>"#;
        let page = parse_list_records(xml).unwrap().into_page().unwrap();
        assert!(page.resumption_token.is_none());
        let record = page.records[0].as_ref().unwrap();
        assert_eq!(record.header.datestamp, None);
        assert_eq!(record.metadata.as_deref(), Some("<x/>"));
    }

    #[test]
    fn prefixed_namespaces_are_matched_by_local_name() {
        let xml = r#"<oai:OAI-PMH xmlns:oai="http://www.openarchives.org/OAI/2.0/">
  <oai:error code="noRecordsMatch"/>
</oai:OAI-PMH>"#;
        let err = parse_list_records(xml).unwrap().into_page().unwrap_err();
        assert_eq!(err.protocol().unwrap().code, OaiErrorCode::NoRecordsMatch);
    }

    #[test]
    fn bad_header_only_fails_that_record() {
        let xml = r#"<OAI-PMH><ListRecords>
  <record><header><datestamp>2021-01-01</datestamp></header></record>
  <record><header><identifier>b</identifier><datestamp>not a date</datestamp></header></record>
  <record><header><identifier>c</identifier><datestamp>2021-01-02</datestamp></header></record>
</ListRecords></OAI-PMH>"#;
        let page = parse_list_records(xml).unwrap().into_page().unwrap();
        assert_eq!(page.records.len(), 3);
        assert!(matches!(page.records[0], Err(HarvestError::Parse { .. })));
        assert!(matches!(page.records[1], Err(HarvestError::Parse { .. })));
        assert_eq!(page.records[2].as_ref().unwrap().header.identifier, "c");
    }

    #[test]
    fn non_oai_body_is_rejected() {
        let err = parse_list_records("<html><body>Service Unavailable</body></html>").unwrap_err();
        assert!(matches!(err, HarvestError::Xml(_)));
        assert!(parse_list_records("").is_err());
    }

    #[test]
    fn truncated_document_keeps_token_and_complete_records() {
        let xml = r#"<OAI-PMH><ListRecords>
  <resumptionToken>tok2</resumptionToken>
  <record><header><identifier>a</identifier></header></record>
  <record><header><identifier>b</identifier></head"#;
        let response = parse_list_records(xml).unwrap();
        assert!(response.malformed.is_some());
        let page = response.into_page().unwrap();
        assert_eq!(page.resumption_token.as_deref(), Some("tok2"));
        assert_eq!(page.records.len(), 1);
        assert!(page.malformed.is_some());
    }

    #[test]
    fn document_cut_at_a_tag_boundary_is_malformed() {
        let xml = r#"<OAI-PMH><ListRecords>
  <record><header><identifier>a</identifier><datestamp>2021-05-01</datestamp></header></record>"#;
        let page = parse_list_records(xml).unwrap().into_page().unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(page.resumption_token.is_none());
        assert!(page.malformed.is_some());

        let complete = parse_list_records("<OAI-PMH><ListRecords/></OAI-PMH>").unwrap();
        assert!(complete.malformed.is_none());
    }
}
