//! Path identity model.
//!
//! A [`StoragePath`] is an ordered sequence of named, optionally identified
//! segments addressing one location on a provider, independent of how the
//! backend actually keys its objects. The first segment is always the root
//! (empty name), which stands for the provider's configured base folder.
//!
//! Backends that address objects by something other than names (database
//! ids, commit SHAs, branch names) stash that data in the segment
//! `identifier` and `context` fields instead of subclassing the path.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result};

/// Characters escaped when rendering a segment back into a raw path.
const SEGMENT_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Backend-specific context attached to a segment (branch, commit, ...).
pub type SegmentContext = BTreeMap<String, String>;

/// Whether a path names a file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    File,
    Folder,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::File => write!(f, "file"),
            Kind::Folder => write!(f, "folder"),
        }
    }
}

/// One component of a [`StoragePath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSegment {
    name: String,
    #[serde(default)]
    identifier: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    context: SegmentContext,
}

impl PathSegment {
    /// Create a segment from an already decoded name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifier: None,
            context: SegmentContext::new(),
        }
    }

    pub fn with_identifier(mut self, identifier: Option<String>) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn with_context(mut self, context: SegmentContext) -> Self {
        self.context = context;
        self
    }

    /// Decoded, human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Percent-encoded name as it appears in a raw path.
    pub fn raw(&self) -> String {
        utf8_percent_encode(&self.name, SEGMENT_ENCODE_SET).to_string()
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn context(&self) -> &SegmentContext {
        &self.context
    }
}

/// A location on a provider.
///
/// Equality covers every segment's name, identifier and context as well as
/// the file/folder flag: two paths naming the same place with different
/// identifiers are different paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoragePath {
    segments: Vec<PathSegment>,
    folder: bool,
}

impl StoragePath {
    /// The provider's configured base folder.
    pub fn root() -> Self {
        Self {
            segments: vec![PathSegment::new("")],
            folder: true,
        }
    }

    /// Parse a raw, percent-encoded path string.
    ///
    /// The path is a folder iff the string ends in `/`. `"/"` is the root.
    ///
    /// # Errors
    /// - String does not start with `/`
    /// - Empty segments (`//`), `.` or `..` segments, NUL bytes
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw
            .strip_prefix('/')
            .ok_or_else(|| Error::InvalidPath(format!("Path must start with '/': {}", raw)))?;

        if rest.is_empty() {
            return Ok(Self::root());
        }

        let folder = rest.ends_with('/');
        let body = if folder { &rest[..rest.len() - 1] } else { rest };

        let mut segments = vec![PathSegment::new("")];
        for part in body.split('/') {
            let name = percent_decode_str(part)
                .decode_utf8()
                .map_err(|_| Error::InvalidPath(format!("Path is not valid UTF-8: {}", raw)))?;
            validate_name(&name).map_err(|reason| {
                Error::InvalidPath(format!("{} in path {}", reason, raw))
            })?;
            segments.push(PathSegment::new(name.into_owned()));
        }

        Ok(Self { segments, folder })
    }

    /// Parse a raw path and assert it has the expected kind.
    ///
    /// Providers use this when they already know what the caller must be
    /// addressing; a folder path has to end in `/`, a file path must not.
    pub fn parse_kind(raw: &str, kind: Kind) -> Result<Self> {
        let path = Self::parse(raw)?;
        if path.kind() != kind {
            return Err(Error::InvalidPath(format!(
                "Expected a {} path, got {}",
                kind, raw
            )));
        }
        Ok(path)
    }

    /// Build a path from explicit segments.
    ///
    /// # Errors
    /// - No segments, or the first segment is not the root
    /// - Any other segment has an invalid name
    /// - A root-only path marked as a file
    pub fn from_segments(segments: Vec<PathSegment>, folder: bool) -> Result<Self> {
        match segments.first() {
            Some(first) if first.name.is_empty() => {}
            _ => {
                return Err(Error::InvalidPath(
                    "Path must begin with a root segment".to_string(),
                ))
            }
        }
        for segment in &segments[1..] {
            validate_name(&segment.name).map_err(|reason| Error::InvalidPath(reason.to_string()))?;
        }
        if segments.len() == 1 && !folder {
            return Err(Error::InvalidPath("Root path must be a folder".to_string()));
        }
        Ok(Self { segments, folder })
    }

    pub fn is_root(&self) -> bool {
        self.segments.len() == 1
    }

    pub fn is_folder(&self) -> bool {
        self.folder
    }

    pub fn is_file(&self) -> bool {
        !self.folder
    }

    pub fn kind(&self) -> Kind {
        if self.folder {
            Kind::Folder
        } else {
            Kind::File
        }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    fn last(&self) -> &PathSegment {
        // Invariant: never empty.
        &self.segments[self.segments.len() - 1]
    }

    /// Name of the last segment (empty for the root).
    pub fn name(&self) -> &str {
        self.last().name()
    }

    /// Extension of a file name including the dot, or `""`.
    pub fn ext(&self) -> &str {
        if self.folder {
            return "";
        }
        split_ext(self.name()).1
    }

    /// Identifier of the last segment.
    pub fn identifier(&self) -> Option<&str> {
        self.last().identifier()
    }

    /// Backend context of the last segment.
    pub fn context(&self) -> &SegmentContext {
        self.last().context()
    }

    /// Decoded segment names below the root.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.segments[1..].iter().map(PathSegment::name)
    }

    /// Append one segment.
    ///
    /// Without an explicit identifier the new segment inherits the parent's
    /// backend context, so descendants stay pinned to the same branch or
    /// commit without repeating it.
    pub fn child(
        &self,
        name: impl Into<String>,
        identifier: Option<String>,
        folder: bool,
    ) -> Result<Self> {
        let context = if identifier.is_some() {
            SegmentContext::new()
        } else {
            self.context().clone()
        };
        self.child_with_context(name, identifier, context, folder)
    }

    /// Append one segment with an explicit backend context.
    pub fn child_with_context(
        &self,
        name: impl Into<String>,
        identifier: Option<String>,
        context: SegmentContext,
        folder: bool,
    ) -> Result<Self> {
        if self.is_file() {
            return Err(Error::InvalidPath(format!(
                "Cannot create a child of file path {}",
                self
            )));
        }
        let name = name.into();
        validate_name(&name).map_err(|reason| Error::InvalidPath(reason.to_string()))?;

        let mut segments = self.segments.clone();
        segments.push(
            PathSegment::new(name)
                .with_identifier(identifier)
                .with_context(context),
        );
        Ok(Self { segments, folder })
    }

    /// Drop the last segment. `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
            folder: true,
        })
    }

    /// Same location with the last segment renamed.
    ///
    /// The identifier is cleared: a renamed target is a different object
    /// until the backend says otherwise.
    pub fn with_name(&self, name: impl Into<String>) -> Result<Self> {
        if self.is_root() {
            return Err(Error::InvalidPath("Cannot rename the root path".to_string()));
        }
        let name = name.into();
        validate_name(&name).map_err(|reason| Error::InvalidPath(reason.to_string()))?;

        let mut segments = self.segments.clone();
        let last = segments.len() - 1;
        segments[last].name = name;
        segments[last].identifier = None;
        Ok(Self {
            segments,
            folder: self.folder,
        })
    }

    /// Same path with the backend identifier of the last segment replaced.
    pub fn with_identifier(&self, identifier: Option<String>) -> Self {
        let mut segments = self.segments.clone();
        let last = segments.len() - 1;
        segments[last].identifier = identifier;
        Self {
            segments,
            folder: self.folder,
        }
    }

    /// Next candidate name under the `keep` conflict policy.
    ///
    /// `report.pdf` becomes `report (1).pdf`, `report (1).pdf` becomes
    /// `report (2).pdf`. Folders are counted the same way without the
    /// extension split.
    pub fn increment_name(&self) -> Result<Self> {
        if self.is_root() {
            return Err(Error::InvalidPath("Cannot rename the root path".to_string()));
        }
        let name = self.name();
        let (stem, ext) = if self.folder {
            (name, "")
        } else {
            split_ext(name)
        };
        let (base, count) = split_counter(stem);
        self.with_name(format!("{} ({}){}", base, count + 1, ext))
    }

    /// Whether `self` lives somewhere below `ancestor`, comparing names only.
    pub fn is_descendant_of(&self, ancestor: &StoragePath) -> bool {
        ancestor.folder
            && ancestor.segments.len() < self.segments.len()
            && ancestor
                .segments
                .iter()
                .zip(&self.segments)
                .all(|(a, b)| a.name == b.name)
    }

    /// Whether `self` is a direct child of `parent`, comparing names only.
    pub fn is_child_of(&self, parent: &StoragePath) -> bool {
        self.is_descendant_of(parent) && self.segments.len() == parent.segments.len() + 1
    }

    /// Names leading from `ancestor` down to `self`.
    pub fn relative_to(&self, ancestor: &StoragePath) -> Option<Vec<&str>> {
        if !self.is_descendant_of(ancestor) {
            return None;
        }
        Some(
            self.segments[ancestor.segments.len()..]
                .iter()
                .map(PathSegment::name)
                .collect(),
        )
    }

    /// Human-readable path built from decoded names.
    pub fn materialized_path(&self) -> String {
        self.render(|segment| segment.name().to_string())
    }

    /// Path addressed by the last segment's identifier, falling back to
    /// the materialized path when the backend assigned none.
    pub fn identifier_path(&self) -> String {
        match self.identifier() {
            Some(id) if !self.is_root() => {
                format!("/{}{}", id, if self.folder { "/" } else { "" })
            }
            _ => self.materialized_path(),
        }
    }

    fn render(&self, segment: impl Fn(&PathSegment) -> String) -> String {
        if self.is_root() {
            return "/".to_string();
        }
        let mut out = String::new();
        for part in &self.segments[1..] {
            out.push('/');
            out.push_str(&segment(part));
        }
        if self.folder {
            out.push('/');
        }
        out
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(PathSegment::raw))
    }
}

fn validate_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("Empty path segment");
    }
    if name == "." || name == ".." {
        return Err("Relative path segment");
    }
    if name.contains('/') || name.contains('\0') {
        return Err("Path segment contains a separator or NUL byte");
    }
    Ok(())
}

fn split_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    }
}

fn split_counter(stem: &str) -> (&str, u64) {
    if let Some(inner) = stem.strip_suffix(')') {
        if let Some(open) = inner.rfind(" (") {
            let digits = &inner[open + 2..];
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(count) = digits.parse::<u64>() {
                    return (&stem[..open], count);
                }
            }
        }
    }
    (stem, 0)
}
