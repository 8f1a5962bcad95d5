//! Minimal `207 Multi-Status` reader for PROPFIND responses.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::Result;

pub(crate) const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:"><D:prop><D:resourcetype/><D:getcontentlength/></D:prop></D:propfind>"#;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct RawEntry {
    pub href: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Clone, Copy)]
enum Field {
    Href,
    Length,
}

/// Pull `href`, `resourcetype/collection` and `getcontentlength` out of every
/// `response` element, ignoring namespace prefixes.
pub(crate) fn parse_multistatus(xml: &str) -> Result<Vec<RawEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<RawEntry> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"response" => current = Some(RawEntry::default()),
                b"href" => field = Some(Field::Href),
                b"getcontentlength" => field = Some(Field::Length),
                b"collection" => {
                    if let Some(entry) = current.as_mut() {
                        entry.is_dir = true;
                    }
                }
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.is_dir = true;
                    }
                }
            }
            Event::Text(text) => {
                if let (Some(entry), Some(field)) = (current.as_mut(), field) {
                    let text = text.unescape()?;
                    match field {
                        Field::Href => entry.href = text.into_owned(),
                        Field::Length => entry.size = text.trim().parse().unwrap_or(0),
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"response" => {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                b"href" | b"getcontentlength" => field = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multistatus() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/bmcl/</d:href>
    <d:propstat>
      <d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/bmcl/de/deadbeef</d:href>
    <d:propstat>
      <d:prop><d:resourcetype/><d:getcontentlength>4</d:getcontentlength></d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

        let entries = parse_multistatus(xml).unwrap();
        assert_eq!(
            entries,
            vec![
                RawEntry {
                    href: "/dav/bmcl/".to_string(),
                    is_dir: true,
                    size: 0
                },
                RawEntry {
                    href: "/dav/bmcl/de/deadbeef".to_string(),
                    is_dir: false,
                    size: 4
                },
            ]
        );
    }
}
