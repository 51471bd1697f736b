//! PDF Image Adapter Module
//!
//! Exposes the embedded JPEG and JPEG 2000 images of a PDF as pages. Listing
//! parses the document once, capped by `max_archive_size`, and keeps only
//! where each image stream sits in the file. Extraction seeks there and
//! streams the bytes without parsing the document again.
//! Pages get synthesized member paths (`page_0001_0.jpg`) in document order.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use lopdf::xref::XrefEntry;
use lopdf::{Dictionary, Document, Object, ObjectId};
use tracing::{debug, warn};

use super::extraction::PendingExtraction;
use super::format_detection::ArchiveFormat;
use super::security::SecurityValidator;
use super::types::{ArchiveEntry, RawEntry};
use super::FormatHandler;
use crate::error::{Error, Result};
use crate::task::CancellationToken;

const PDF_MAGIC: &[u8] = b"%PDF-";

/// Resource dictionaries are inherited through at most this many ancestors.
const MAX_PARENT_DEPTH: usize = 32;

/// How far past the object header the `stream` keyword may appear.
const STREAM_KEYWORD_WINDOW: u64 = 64 * 1024;

/// Location of one image stream inside the PDF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ImageLocation {
    /// Byte offset of the `N G obj` header
    object_offset: u64,
    /// Raw stream length
    length: u64,
}

/// PDF image extraction handler
pub struct PdfHandler {
    max_archive_size: u64,
    images: Mutex<HashMap<String, ImageLocation>>,
}

impl PdfHandler {
    pub fn new(max_archive_size: u64) -> Self {
        Self {
            max_archive_size,
            images: Mutex::new(HashMap::new()),
        }
    }

    pub fn can_open(magic: &[u8]) -> bool {
        magic.starts_with(PDF_MAGIC)
    }

    fn parse(
        &self,
        archive: &Path,
        validator: &SecurityValidator,
    ) -> Result<(Vec<RawEntry>, HashMap<String, ImageLocation>)> {
        let size = std::fs::metadata(archive)?.len();
        if size > self.max_archive_size {
            warn!("PDF of {} bytes exceeds parse limit of {}", size, self.max_archive_size);
            return Err(Error::ArchiveTooLarge {
                size,
                limit: self.max_archive_size,
            });
        }

        let document = Document::load(archive).map_err(Error::extraction)?;
        if document.is_encrypted() {
            return Err(Error::extraction("encrypted PDF"));
        }

        let mut images = HashMap::new();
        let mut listing = Vec::new();

        for (page_number, page_id) in document.get_pages() {
            for (position, (image_id, extension, length)) in
                page_images(&document, page_id).into_iter().enumerate()
            {
                let Some(object_offset) = object_offset(&document, image_id) else {
                    debug!("Skipping image {:?} without a direct file offset", image_id);
                    continue;
                };
                validator.validate_entry_count(listing.len() + 1)?;
                let path = format!("page_{page_number:04}_{position}.{extension}");
                listing.push(RawEntry::file(path.clone(), length));
                images.insert(
                    path,
                    ImageLocation {
                        object_offset,
                        length,
                    },
                );
            }
        }

        debug!("PDF {} yielded {} images", archive.display(), listing.len());
        Ok((listing, images))
    }
}

/// File offset of an uncompressed object, from the cross-reference table.
fn object_offset(document: &Document, id: ObjectId) -> Option<u64> {
    match document.reference_table.get(id.0)? {
        XrefEntry::Normal { offset, .. } => Some(u64::from(*offset)),
        _ => None,
    }
}

/// Offset of the first stream byte of the object starting at `object_offset`.
fn stream_data_offset(file: &mut File, object_offset: u64) -> Result<u64> {
    file.seek(SeekFrom::Start(object_offset))?;
    let mut window = Vec::new();
    file.by_ref().take(STREAM_KEYWORD_WINDOW).read_to_end(&mut window)?;

    let keyword = window
        .windows(6)
        .enumerate()
        .position(|(i, w)| {
            w == b"stream" && i > 0 && (window[i - 1] == b'>' || window[i - 1].is_ascii_whitespace())
        })
        .ok_or_else(|| Error::extraction("PDF image stream not found"))?;

    let mut start = keyword + 6;
    match window.get(start..start + 2) {
        Some(b"\r\n") => start += 2,
        _ if matches!(window.get(start), Some(b'\n' | b'\r')) => start += 1,
        _ => return Err(Error::extraction("malformed PDF stream keyword")),
    }
    Ok(object_offset + start as u64)
}

/// Image XObjects on one page whose stream is already a standalone file.
fn page_images(document: &Document, page_id: ObjectId) -> Vec<(ObjectId, &'static str, u64)> {
    let Some(resources) = page_resources(document, page_id) else {
        return Vec::new();
    };
    let Ok(xobjects) = resources
        .get_deref(b"XObject", document)
        .and_then(Object::as_dict)
    else {
        return Vec::new();
    };

    let mut names: Vec<&Vec<u8>> = xobjects.iter().map(|(name, _)| name).collect();
    names.sort();

    names
        .into_iter()
        .filter_map(|name| {
            let Ok(Object::Reference(id)) = xobjects.get(name) else {
                return None;
            };
            let Ok(Object::Stream(stream)) = document.get_object(*id) else {
                return None;
            };
            if !matches!(stream.dict.get(b"Subtype"), Ok(Object::Name(n)) if n.as_slice() == b"Image") {
                return None;
            }
            let extension = image_extension(document, &stream.dict)?;
            Some((*id, extension, stream.content.len() as u64))
        })
        .collect()
}

/// The page's own or inherited `/Resources` dictionary.
fn page_resources(document: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let mut node = document.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_PARENT_DEPTH {
        if let Ok(resources) = node.get_deref(b"Resources", document).and_then(Object::as_dict) {
            return Some(resources);
        }
        node = node.get_deref(b"Parent", document).and_then(Object::as_dict).ok()?;
    }
    None
}

/// Final filter of an image stream mapped to a file extension. Only filters
/// whose output is a complete image file are usable as pages.
fn image_extension(document: &Document, dict: &Dictionary) -> Option<&'static str> {
    let filter = dict.get_deref(b"Filter", document).ok()?;
    let last = match filter {
        Object::Name(name) => name.as_slice(),
        Object::Array(filters) if filters.len() == 1 => match &filters[0] {
            Object::Name(name) => name.as_slice(),
            _ => return None,
        },
        _ => return None,
    };
    match last {
        b"DCTDecode" => Some("jpg"),
        b"JPXDecode" => Some("jp2"),
        _ => None,
    }
}

impl FormatHandler for PdfHandler {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Pdf
    }

    fn read_listing(&self, archive: &Path, validator: &SecurityValidator) -> Result<Vec<RawEntry>> {
        let (listing, images) = self.parse(archive, validator)?;
        *self
            .images
            .lock()
            .map_err(|_| Error::extraction("PDF state poisoned"))? = images;
        Ok(listing)
    }

    fn extract_member(
        &self,
        archive: &Path,
        entry: &ArchiveEntry,
        out: &mut PendingExtraction,
        limit: u64,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let location = self
            .images
            .lock()
            .map_err(|_| Error::extraction("PDF state poisoned"))?
            .get(&entry.path)
            .copied()
            .ok_or_else(|| Error::UnknownEntry {
                path: entry.path.clone(),
            })?;

        let mut file = File::open(archive)?;
        let start = stream_data_offset(&mut file, location.object_offset)?;
        file.seek(SeekFrom::Start(start))?;
        out.fill_from(&mut file.take(location.length), entry, limit, cancel)
    }
}
