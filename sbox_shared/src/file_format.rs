//! `SBOX` project container: a fixed little-endian header followed by the
//! project as an XML document.
//!
//! ```text
//! offset  size  field
//!      0     4  tag "SBOX"
//!      4     4  format version (u32 LE)
//!      8     4  XML payload size in bytes (u32 LE)
//!     12     4  voice count (u32 LE)
//!     16    32  reserved (8 x u32, zero)
//!     48     n  UTF-8 XML
//! ```

use crate::error::ProjectError;
use crate::pattern::{Note, Pattern};
use crate::project::{GlobalFxSlot, Project, Voice};
use crate::xml::{parse_document, write_document, XmlElement};
use crate::{FX_PARAMS_PER_SLOT, NUM_GLOBAL_FX, NUM_VOICES};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use std::path::Path;

pub const PROJECT_TAG: &[u8; 4] = b"SBOX";
pub const PROJECT_FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 48;
const RESERVED_WORDS: usize = 8;
const ROOT_ELEMENT: &str = "surgebox-project";

/// Decoded container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectHeader {
    pub version: u32,
    pub xml_size: u32,
    pub num_voices: u32,
}

impl ProjectHeader {
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<(), ProjectError> {
        out.extend_from_slice(PROJECT_TAG);
        out.write_u32::<LittleEndian>(self.version)?;
        out.write_u32::<LittleEndian>(self.xml_size)?;
        out.write_u32::<LittleEndian>(self.num_voices)?;
        for _ in 0..RESERVED_WORDS {
            out.write_u32::<LittleEndian>(0)?;
        }
        Ok(())
    }

    /// Reads and validates the header at the front of `bytes`.
    pub fn read_from(bytes: &[u8]) -> Result<Self, ProjectError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProjectError::Truncated {
                expected: HEADER_SIZE,
                found: bytes.len(),
            });
        }

        let mut cursor = Cursor::new(bytes);
        let mut tag = [0u8; 4];
        cursor.read_exact(&mut tag)?;
        if &tag != PROJECT_TAG {
            return Err(ProjectError::BadTag);
        }

        let version = cursor.read_u32::<LittleEndian>()?;
        if version > PROJECT_FORMAT_VERSION {
            return Err(ProjectError::UnsupportedVersion {
                found: version,
                supported: PROJECT_FORMAT_VERSION,
            });
        }

        let xml_size = cursor.read_u32::<LittleEndian>()?;
        let num_voices = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            version,
            xml_size,
            num_voices,
        })
    }
}

impl Project {
    /// Serializes the project into a complete container.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProjectError> {
        let xml = write_document(&self.to_xml())?;
        let header = ProjectHeader {
            version: PROJECT_FORMAT_VERSION,
            xml_size: xml.len() as u32,
            num_voices: NUM_VOICES as u32,
        };

        let mut out = Vec::with_capacity(HEADER_SIZE + xml.len());
        header.write_to(&mut out)?;
        out.extend_from_slice(xml.as_bytes());
        Ok(out)
    }

    /// Parses a container into a fresh project. Fields missing from the XML
    /// keep their defaults, so older files load.
    pub fn from_bytes(bytes: &[u8]) -> Result<Project, ProjectError> {
        let header = ProjectHeader::read_from(bytes)?;
        let xml_size = header.xml_size as usize;
        let payload = &bytes[HEADER_SIZE..];
        if payload.len() < xml_size {
            return Err(ProjectError::Truncated {
                expected: HEADER_SIZE + xml_size,
                found: bytes.len(),
            });
        }

        let xml = std::str::from_utf8(&payload[..xml_size])?;
        let root = parse_document(xml)?;
        if root.name != ROOT_ELEMENT {
            return Err(ProjectError::MissingRoot);
        }

        let mut project = Project::new();
        project.apply_xml(&root);
        Ok(project)
    }

    /// Stamps `modified_date` and writes the container to `path`.
    pub fn save_to_file(&mut self, path: impl AsRef<Path>) -> Result<(), ProjectError> {
        let path = path.as_ref();
        self.touch_modified();
        let bytes = self.to_bytes()?;
        std::fs::write(path, &bytes)?;
        log::info!("[Project] Saved '{}' to {:?} ({} bytes)", self.project_name, path, bytes.len());
        Ok(())
    }

    /// Replaces this project with the one stored at `path`. On error the
    /// current project is left as it was.
    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), ProjectError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        match Project::from_bytes(&bytes) {
            Ok(project) => {
                *self = project;
                log::info!("[Project] Loaded '{}' from {:?}", self.project_name, path);
                Ok(())
            }
            Err(e) => {
                log::warn!("[Project] Failed to load {:?}: {}", path, e);
                Err(e)
            }
        }
    }

    pub fn to_xml(&self) -> XmlElement {
        let mut root = XmlElement::new(ROOT_ELEMENT).with_attr("version", PROJECT_FORMAT_VERSION);

        let mut global = XmlElement::new("global")
            .with_attr("tempo", self.tempo)
            .with_attr("loop_bars", self.loop_bars)
            .with_attr("swing", self.swing)
            .with_attr("master_volume", self.master_volume);
        let mut fx = XmlElement::new("global_fx");
        for (index, slot) in self.global_fx.iter().enumerate() {
            fx.push_child(slot_to_xml(slot, index));
        }
        global.push_child(fx);
        root.push_child(global);

        for (index, voice) in self.voices.iter().enumerate() {
            root.push_child(voice_to_xml(voice, index));
        }

        let mut meta = XmlElement::new("meta")
            .with_attr("name", &self.project_name)
            .with_attr("author", &self.author)
            .with_attr("created", &self.created_date)
            .with_attr("modified", &self.modified_date);
        if !self.comment.is_empty() {
            meta.push_child(XmlElement::new("comment").with_text(self.comment.as_str()));
        }
        if !self.tags.is_empty() {
            let mut tags = XmlElement::new("tags");
            for tag in &self.tags {
                tags.push_child(XmlElement::new("tag").with_text(tag.as_str()));
            }
            meta.push_child(tags);
        }
        root.push_child(meta);

        root
    }

    /// Overlays whatever the document provides onto `self`.
    pub fn apply_xml(&mut self, root: &XmlElement) {
        if let Some(global) = root.child("global") {
            if let Some(tempo) = global.attr_parse::<f64>("tempo") {
                if tempo.is_finite() && tempo > 0.0 {
                    self.tempo = tempo;
                }
            }
            read_into(global, "loop_bars", &mut self.loop_bars);
            read_finite(global, "swing", &mut self.swing);
            read_finite(global, "master_volume", &mut self.master_volume);

            if let Some(fx) = global.child("global_fx") {
                for slot_el in fx.children_named("slot") {
                    if let Some(slot) = index_attr(slot_el)
                        .filter(|&i| i < NUM_GLOBAL_FX)
                        .map(|i| &mut self.global_fx[i])
                    {
                        slot_from_xml(slot, slot_el);
                    }
                }
            }
        }

        for voice_el in root.children_named("voice") {
            if let Some(voice) = index_attr(voice_el)
                .filter(|&i| i < NUM_VOICES)
                .map(|i| &mut self.voices[i])
            {
                voice_from_xml(voice, voice_el);
            }
        }

        if let Some(meta) = root.child("meta") {
            read_string(meta, "name", &mut self.project_name);
            read_string(meta, "author", &mut self.author);
            read_string(meta, "created", &mut self.created_date);
            read_string(meta, "modified", &mut self.modified_date);

            if let Some(comment) = meta.child("comment") {
                if !comment.text().is_empty() {
                    self.comment = comment.text().to_string();
                }
            }

            self.tags.clear();
            if let Some(tags) = meta.child("tags") {
                self.tags.extend(
                    tags.children_named("tag")
                        .filter(|t| !t.text().is_empty())
                        .map(|t| t.text().to_string()),
                );
            }
        }
    }
}

fn read_into<T: std::str::FromStr>(element: &XmlElement, key: &str, target: &mut T) {
    if let Some(value) = element.attr_parse(key) {
        *target = value;
    }
}

/// Like [`read_into`], but ignores NaN and infinities.
fn read_finite<T>(element: &XmlElement, key: &str, target: &mut T)
where
    T: std::str::FromStr + Into<f64> + Copy,
{
    if let Some(value) = element.attr_parse::<T>(key) {
        if value.into().is_finite() {
            *target = value;
        }
    }
}

fn read_string(element: &XmlElement, key: &str, target: &mut String) {
    if let Some(value) = element.attr(key) {
        *target = value.to_string();
    }
}

fn read_flag(element: &XmlElement, key: &str, target: &mut bool) {
    if let Some(value) = element.attr_parse::<i64>(key) {
        *target = value != 0;
    }
}

/// A missing index reads as 0; negative ones map to `None`.
fn index_attr(element: &XmlElement) -> Option<usize> {
    element
        .attr_parse::<i64>("index")
        .unwrap_or(0)
        .try_into()
        .ok()
}

fn slot_to_xml(slot: &GlobalFxSlot, index: usize) -> XmlElement {
    let mut el = XmlElement::new("slot")
        .with_attr("index", index)
        .with_attr("type", slot.fx_type)
        .with_attr("enabled", u8::from(slot.enabled));
    for (i, value) in slot.params.iter().enumerate() {
        el.push_child(XmlElement::new("param").with_attr("index", i).with_attr("value", value));
    }
    el
}

fn slot_from_xml(slot: &mut GlobalFxSlot, el: &XmlElement) {
    read_into(el, "type", &mut slot.fx_type);
    read_flag(el, "enabled", &mut slot.enabled);
    for param in el.children_named("param") {
        if let Some(i) = index_attr(param).filter(|&i| i < FX_PARAMS_PER_SLOT) {
            slot.params[i] = param
                .attr_parse::<f32>("value")
                .filter(|v| v.is_finite())
                .unwrap_or(0.0);
        }
    }
}

fn voice_to_xml(voice: &Voice, index: usize) -> XmlElement {
    let mut el = XmlElement::new("voice")
        .with_attr("index", index)
        .with_attr("name", &voice.name);

    el.push_child(
        XmlElement::new("mixer")
            .with_attr("volume", voice.volume)
            .with_attr("pan", voice.pan)
            .with_attr("sendA", voice.send_a)
            .with_attr("sendB", voice.send_b)
            .with_attr("mute", u8::from(voice.mute))
            .with_attr("solo", u8::from(voice.solo)),
    );

    if !voice.patch_data.is_empty() {
        el.push_child(
            XmlElement::new("patch")
                .with_attr("size", voice.patch_data.len())
                .with_text(encode_hex(&voice.patch_data)),
        );
    }

    el.push_child(pattern_to_xml(&voice.pattern));
    el
}

fn voice_from_xml(voice: &mut Voice, el: &XmlElement) {
    read_string(el, "name", &mut voice.name);

    if let Some(mixer) = el.child("mixer") {
        read_finite(mixer, "volume", &mut voice.volume);
        read_finite(mixer, "pan", &mut voice.pan);
        read_finite(mixer, "sendA", &mut voice.send_a);
        read_finite(mixer, "sendB", &mut voice.send_b);
        read_flag(mixer, "mute", &mut voice.mute);
        read_flag(mixer, "solo", &mut voice.solo);
    }

    voice.patch_data.clear();
    if let Some(patch) = el.child("patch") {
        let size = patch.attr_parse::<usize>("size").unwrap_or(0);
        voice.patch_data = decode_hex(patch.text(), size);
    }

    if let Some(pattern) = el.child("pattern") {
        voice.pattern = pattern_from_xml(pattern);
    }
}

fn pattern_to_xml(pattern: &Pattern) -> XmlElement {
    let mut el = XmlElement::new("pattern")
        .with_attr("bars", pattern.bars)
        .with_attr("swing", pattern.swing);
    for note in pattern.notes() {
        el.push_child(
            XmlElement::new("note")
                .with_attr("start", note.start_beat)
                .with_attr("duration", note.duration)
                .with_attr("pitch", note.pitch)
                .with_attr("velocity", note.velocity),
        );
    }
    el
}

fn pattern_from_xml(el: &XmlElement) -> Pattern {
    let defaults = Pattern::default();
    let bars = el.attr_parse("bars").unwrap_or(defaults.bars);
    let mut swing = defaults.swing;
    read_finite(el, "swing", &mut swing);
    Pattern::from_notes(bars, swing, el.children_named("note").filter_map(note_from_xml))
}

/// Notes whose start or duration is not a finite number are dropped, as are
/// notes that would never sound.
fn note_from_xml(el: &XmlElement) -> Option<Note> {
    let mut note = Note::default();
    if let Some(start) = el.attr_parse::<f64>("start") {
        if !start.is_finite() {
            return None;
        }
        note.start_beat = start.max(0.0);
    }
    if let Some(duration) = el.attr_parse::<f64>("duration") {
        if !(duration.is_finite() && duration > 0.0) {
            return None;
        }
        note.duration = duration;
    }
    if let Some(pitch) = el.attr_parse::<i64>("pitch") {
        note.pitch = pitch.clamp(0, 127) as u8;
    }
    if let Some(velocity) = el.attr_parse::<i64>("velocity") {
        note.velocity = velocity.clamp(1, 127) as u8;
    }
    Some(note)
}

/// Lowercase hex, two characters per byte.
pub fn encode_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

/// Decodes up to `size` bytes from `text`, stopping early when the text runs
/// out. Pairs that are not valid hex are skipped.
pub fn decode_hex(text: &str, size: usize) -> Vec<u8> {
    let digits = text.trim().as_bytes();
    let mut out = Vec::with_capacity(size.min(digits.len() / 2));
    for pair in digits.chunks_exact(2).take(size) {
        let decoded = std::str::from_utf8(pair)
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok());
        if let Some(byte) = decoded {
            out.push(byte);
        }
    }
    out
}
