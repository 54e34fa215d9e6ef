//! Atom feed and entry documents.

use super::xml::{self, XmlElement};
use crate::error::{FeedError, Result};
use crate::types::{Entry, EntryInput, Origin, Timestamp};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

pub const ATOM_NS: &str = "http://www.w3.org/2005/Atom";
pub const REPORT_NS: &str = "http://schemas.google.com/report/2010";

/// Media type of encoded documents.
pub const ATOM_CONTENT_TYPE: &str = "application/atom+xml";

const NAMESPACES: [(&str, &str); 2] = [("xmlns", ATOM_NS), ("xmlns:report", REPORT_NS)];

/// Everything needed to render one feed document.
pub struct FeedDocument<'a> {
    /// Feed id; the URI the feed was requested at.
    pub feed_uri: &'a str,
    /// Hub advertised for push subscriptions.
    pub hub: Option<&'a str>,
    /// Entries in the order they should appear.
    pub entries: &'a [Entry],
}

/// Encode a feed document.
pub fn encode_feed(doc: &FeedDocument<'_>) -> Result<String> {
    let updated = doc
        .entries
        .iter()
        .map(|e| e.arrived)
        .max()
        .unwrap_or_else(Timestamp::now);

    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(
        BytesStart::new("feed").with_attributes(NAMESPACES),
    ))?;

    text_element(&mut writer, "id", doc.feed_uri)?;
    text_element(&mut writer, "updated", &updated.to_rfc3339_seconds())?;
    text_element(&mut writer, "title", doc.feed_uri)?;
    if let Some(hub) = doc.hub {
        writer.write_event(Event::Empty(
            BytesStart::new("link").with_attributes([("rel", "hub"), ("href", hub)]),
        ))?;
    }
    for entry in doc.entries {
        write_entry(&mut writer, entry, doc.feed_uri, false)?;
    }

    writer.write_event(Event::End(BytesEnd::new("feed")))?;
    finish(writer)
}

/// Encode a single entry as a standalone document.
pub fn encode_entry(entry: &Entry, feed_uri: &str) -> Result<String> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    write_entry(&mut writer, entry, feed_uri, true)?;
    finish(writer)
}

fn write_entry(
    writer: &mut Writer<Vec<u8>>,
    entry: &Entry,
    feed_uri: &str,
    declare_namespaces: bool,
) -> Result<()> {
    let mut start = BytesStart::new("entry");
    if declare_namespaces {
        start = start.with_attributes(NAMESPACES);
    }
    writer.write_event(Event::Start(start))?;

    text_element(writer, "id", &entry.atom_id(feed_uri))?;
    text_element(writer, "report:subject", &entry.subject_id)?;
    text_element(writer, "title", &entry.title)?;

    writer.write_event(Event::Start(BytesStart::new("author")))?;
    text_element(writer, "uri", &entry.author_uri)?;
    if let Some(email) = entry.author_uri.strip_prefix("mailto:") {
        text_element(writer, "email", email)?;
    }
    writer.write_event(Event::End(BytesEnd::new("author")))?;

    text_element(writer, "report:observed", &entry.observed.to_rfc3339())?;
    text_element(writer, "updated", &entry.arrived.to_rfc3339_seconds())?;

    writer.write_event(Event::Start(
        BytesStart::new("report:content").with_attributes([("type", entry.type_name.as_str())]),
    ))?;
    let payload = xml::parse_fragment(&entry.content)?.to_standalone();
    writer.write_event(Event::Text(BytesText::from_escaped(payload)))?;
    writer.write_event(Event::End(BytesEnd::new("report:content")))?;

    if let Origin::Clone {
        external_feed_id, ..
    } = &entry.origin
    {
        writer.write_event(Event::Start(BytesStart::new("source")))?;
        text_element(writer, "id", external_feed_id)?;
        writer.write_event(Event::End(BytesEnd::new("source")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("entry")))?;
    Ok(())
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn finish(writer: Writer<Vec<u8>>) -> Result<String> {
    String::from_utf8(writer.into_inner()).map_err(|e| FeedError::Serialization(e.to_string()))
}

/// A decoded feed document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedFeed {
    /// The feed's own id.
    pub id: String,
    pub entries: Vec<DecodedEntry>,
    /// Entries dropped because they originated at this instance.
    pub skipped: usize,
}

/// A decoded entry, not yet bound to a local feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedEntry {
    /// The entry's Atom id.
    pub id: String,
    /// `source/id`, present when the sender itself cloned the entry.
    pub source_id: Option<String>,
    pub title: String,
    pub author_uri: String,
    pub subject_id: String,
    pub observed: Timestamp,
    pub type_name: String,
    pub content: String,
}

impl DecodedEntry {
    /// Store as a locally authored entry.
    pub fn into_original(self, feed_name: &str) -> EntryInput {
        EntryInput::new(
            feed_name,
            self.type_name,
            self.subject_id,
            self.author_uri,
            self.observed,
            self.content,
        )
        .with_title(self.title)
    }

    /// Store as a copy of an entry received from `feed_id`.
    ///
    /// An entry that was itself a clone keeps naming the feed it was first
    /// published in.
    pub fn into_clone(self, feed_name: &str, feed_id: &str) -> EntryInput {
        let external_feed_id = self.source_id.clone().unwrap_or_else(|| feed_id.to_string());
        let external_entry_id = self.id.clone();
        self.into_original(feed_name)
            .cloned_from(external_feed_id, external_entry_id)
    }
}

/// Decode a feed document.
///
/// Entries whose id starts with `local_prefix` were authored here and are
/// skipped. Any structural error fails the whole document.
pub fn decode_feed(source: &str, local_prefix: Option<&str>) -> Result<DecodedFeed> {
    let root = xml::parse(source)?;
    if !root.is(ATOM_NS, "feed") {
        return Err(FeedError::MissingElement(
            "document contains no feed".into(),
        ));
    }

    let id = required(&root, "feed", ATOM_NS, "id")?.text.trim().to_string();

    let mut entries = Vec::new();
    let mut skipped = 0;
    for element in root.children_named(ATOM_NS, "entry") {
        let entry = decode_entry(element)?;
        if local_prefix.is_some_and(|prefix| entry.id.starts_with(prefix)) {
            skipped += 1;
            continue;
        }
        entries.push(entry);
    }

    Ok(DecodedFeed {
        id,
        entries,
        skipped,
    })
}

fn decode_entry(entry: &XmlElement) -> Result<DecodedEntry> {
    let id = required(entry, "entry", ATOM_NS, "id")?.text.trim().to_string();

    let author = required(entry, "entry", ATOM_NS, "author")?;
    let author_uri = match author.child_text(ATOM_NS, "uri") {
        "" => match author.child_text(ATOM_NS, "email") {
            "" => {
                return Err(FeedError::MissingElement(
                    "author contains no uri".into(),
                ))
            }
            email => format!("mailto:{email}"),
        },
        uri => uri.to_string(),
    };

    let subject_id = required(entry, "entry", REPORT_NS, "subject")?
        .text
        .trim()
        .to_string();
    let observed = Timestamp::from_rfc3339(&required(entry, "entry", REPORT_NS, "observed")?.text)?;

    let content = required(entry, "entry", REPORT_NS, "content")?;
    let type_name = content
        .attribute("type")
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| FeedError::MissingElement("content contains no type".into()))?
        .to_string();
    let payload = match content.children.as_slice() {
        [payload] if payload.clark_name() == type_name => payload,
        _ => {
            return Err(FeedError::MissingElement(format!(
                "content contains no {type_name}"
            )))
        }
    };

    let source_id = entry
        .child(ATOM_NS, "source")
        .map(|source| source.child_text(ATOM_NS, "id").to_string())
        .filter(|id| !id.is_empty());

    Ok(DecodedEntry {
        id,
        source_id,
        title: entry.child_text(ATOM_NS, "title").to_string(),
        author_uri,
        subject_id,
        observed,
        type_name,
        content: payload.to_standalone(),
    })
}

fn required<'a>(
    parent: &'a XmlElement,
    parent_name: &str,
    namespace: &str,
    name: &str,
) -> Result<&'a XmlElement> {
    parent
        .child(namespace, name)
        .ok_or_else(|| FeedError::MissingElement(format!("{parent_name} contains no {name}")))
}
