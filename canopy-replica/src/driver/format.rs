//! How a replicated tree is laid out in a collection.
//!
//! ```text
//!   { _id: "root", format: "fragmented", path: [], state: {...}, revision: 7 }
//!   { _id: "[\"catalog\",\"e1\"]", path: ["catalog", "e1"], state: {...} }
//! ```
//!
//! Every write is planned inside one store transaction and bumps the root
//! revision exactly once. Changes are recorded in a fixed order (container
//! placeholder, stale fragment deletes, fragment upserts by ascending depth)
//! so that [`translate`] can rebuild the written subtrees from a single event.

use std::collections::HashSet;

use canopy_core::{node, Path, Reference};
use serde_json::{json, Value};

use crate::error::DriverError;
use crate::settings::StorageFormat;
use crate::store::{document_id, Change, ChangeEvent, Transaction};
use crate::surgeon::{graft, DocumentSurgeon, Fragment, PLACEHOLDER};

pub const ROOT_ID: &str = "root";
pub const REVISION_ONE: u64 = 1;

const FORMAT_FIELD: &str = "format";
const PATH_FIELD: &str = "path";
const STATE_FIELD: &str = "state";
const REVISION_FIELD: &str = "revision";
const ECHO_FIELD: &str = "echo";

/// A fully gathered tree and the revision it reflects.
#[derive(Debug, Clone, PartialEq)]
pub struct StateAndRevision {
    pub state: Value,
    pub revision: u64,
}

/// ID of the document stored at `address`.
pub fn document_id_for(address: &[String]) -> String {
    if address.is_empty() {
        ROOT_ID.to_string()
    } else {
        Value::Array(address.iter().cloned().map(Value::String).collect()).to_string()
    }
}

fn root_document(format: StorageFormat, state: Value, revision: u64) -> Value {
    json!({
        "_id": ROOT_ID,
        FORMAT_FIELD: format.as_str(),
        PATH_FIELD: [],
        STATE_FIELD: state,
        REVISION_FIELD: revision,
    })
}

fn fragment_document(address: &[String], state: Value) -> Value {
    json!({
        "_id": document_id_for(address),
        PATH_FIELD: address,
        STATE_FIELD: state,
    })
}

fn field(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

fn state_field(relative: &[String]) -> Vec<String> {
    let mut field = field(STATE_FIELD);
    field.extend_from_slice(relative);
    field
}

pub fn detect_format(root: Option<&Value>) -> Result<StorageFormat, DriverError> {
    let root = root.ok_or(DriverError::UninitializedStore)?;
    let text = root
        .get(FORMAT_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| DriverError::malformed(ROOT_ID, "no format field"))?;
    StorageFormat::parse(text).ok_or_else(|| DriverError::UnrecognizedFormat(text.to_string()))
}

pub fn revision_of(root: &Value) -> Result<u64, DriverError> {
    root.get(REVISION_FIELD)
        .and_then(Value::as_u64)
        .ok_or_else(|| DriverError::malformed(ROOT_ID, "no revision field"))
}

fn document_address(document: &Value) -> Result<Vec<String>, DriverError> {
    let id = document_id(document).unwrap_or("?");
    let path = document
        .get(PATH_FIELD)
        .cloned()
        .ok_or_else(|| DriverError::malformed(id, "no path field"))?;
    serde_json::from_value(path).map_err(|e| DriverError::malformed(id, e.to_string()))
}

fn fragment_of(document: &Value) -> Result<Fragment, DriverError> {
    let address = document_address(document)?;
    let state = document
        .get(STATE_FIELD)
        .cloned()
        .ok_or_else(|| DriverError::malformed(document_id_for(&address), "no state field"))?;
    Ok(Fragment::new(address, state))
}

/// Detect the layout of `documents` and gather the tree they hold.
pub fn load(documents: Vec<Value>) -> Result<(StorageFormat, StateAndRevision), DriverError> {
    let root = documents.iter().find(|d| document_id(d) == Some(ROOT_ID));
    let format = detect_format(root)?;
    let revision = root.map(revision_of).transpose()?.unwrap_or(REVISION_ONE);

    let fragments = match format {
        StorageFormat::Single => documents
            .iter()
            .filter(|d| document_id(d) == Some(ROOT_ID))
            .map(fragment_of)
            .collect::<Result<Vec<_>, _>>()?,
        StorageFormat::Fragmented => documents.iter().map(fragment_of).collect::<Result<Vec<_>, _>>()?,
    };
    let state = DocumentSurgeon::gather(fragments)?;
    Ok((format, StateAndRevision { state, revision }))
}

/// Write a fresh tree unless a root document already exists. Returns
/// whether anything was written.
pub fn initialize_collection(
    txn: &mut Transaction<'_>,
    surgeon: &DocumentSurgeon,
    format: StorageFormat,
    state: Value,
    revision: u64,
) -> Result<bool, DriverError> {
    if txn.get(ROOT_ID)?.is_some() {
        return Ok(false);
    }
    let mut residual = state;
    let mut fragments = match format {
        StorageFormat::Single => Vec::new(),
        StorageFormat::Fragmented => {
            let mut parts = surgeon.scatter(&Reference::root(), &Reference::root(), &mut residual)?;
            parts.pop();
            parts
        }
    };
    fragments.sort_by_key(|f| f.address.len());
    txn.insert(root_document(format, residual, revision))?;
    for fragment in fragments {
        txn.insert(fragment_document(&fragment.address, fragment.payload))?;
    }
    Ok(true)
}

/// Record an echo token, bumping the revision. Returns the new revision.
pub fn echo(txn: &mut Transaction<'_>, token: &str) -> Result<u64, DriverError> {
    bump_revision(txn, vec![(field(ECHO_FIELD), Value::String(token.to_string()))])
}

/// Increment the root revision. Returns the new revision.
pub fn bump_revision(
    txn: &mut Transaction<'_>,
    mut extra: Vec<(Vec<String>, Value)>,
) -> Result<u64, DriverError> {
    let root = txn.get(ROOT_ID)?.ok_or(DriverError::UninitializedStore)?;
    let revision = revision_of(&root)? + 1;
    extra.insert(0, (field(REVISION_FIELD), Value::from(revision)));
    txn.update(ROOT_ID, extra, Vec::new())?;
    Ok(revision)
}

// ─── Writes ───────────────────────────────────────────────────────────

/// A single tree update to plan against the collection.
#[derive(Debug, Clone)]
pub enum Write {
    Replace(Value),
    Initialize(Value),
    Delete,
}

/// The layout of one collection as found inside a transaction.
pub struct Layout<'s> {
    format: StorageFormat,
    surgeon: &'s DocumentSurgeon,
}

impl<'s> Layout<'s> {
    pub fn detect(txn: &Transaction<'_>, surgeon: &'s DocumentSurgeon) -> Result<Self, DriverError> {
        let root = txn.get(ROOT_ID)?;
        let format = detect_format(root.as_ref())?;
        Ok(Self { format, surgeon })
    }

    pub fn format(&self) -> StorageFormat {
        self.format
    }

    fn is_fragment_address(&self, address: &[String]) -> bool {
        self.format == StorageFormat::Fragmented
            && !address.is_empty()
            && self.surgeon.is_graft_entry(&Path::of(address.iter().cloned()))
    }

    /// The deepest stored document whose address is a prefix of `path`,
    /// no longer than `limit` segments.
    fn owner(
        &self,
        txn: &Transaction<'_>,
        path: &[String],
        limit: usize,
    ) -> Result<(Vec<String>, Value), DriverError> {
        for len in (1..=limit.min(path.len())).rev() {
            let prefix = &path[..len];
            if self.is_fragment_address(prefix) {
                if let Some(document) = txn.get(&document_id_for(prefix))? {
                    return Ok((prefix.to_vec(), document));
                }
            }
        }
        let root = txn.get(ROOT_ID)?.ok_or(DriverError::UninitializedStore)?;
        Ok((Vec::new(), root))
    }

    /// The stored value of the node at `path`, with any placeholders for
    /// deeper fragments left in place.
    pub fn read_node(&self, txn: &Transaction<'_>, path: &[String]) -> Result<Option<Value>, DriverError> {
        let (address, document) = self.owner(txn, path, path.len())?;
        let Some(state) = document.get(STATE_FIELD) else {
            return Ok(None);
        };
        Ok(node::lookup(state, &path[address.len()..]).cloned())
    }

    pub fn precondition_holds(
        &self,
        txn: &Transaction<'_>,
        precondition: &Path,
        required_value: &str,
    ) -> Result<bool, DriverError> {
        let value = self.read_node(txn, precondition.segments())?;
        Ok(matches!(value, Some(Value::String(s)) if s == required_value))
    }

    /// Plan `write` at `target`. Returns whether anything changed; the
    /// caller bumps the revision if so.
    pub fn apply(&self, txn: &mut Transaction<'_>, target: &Path, write: Write) -> Result<bool, DriverError> {
        match write {
            Write::Replace(value) => self.put(txn, target, value, false),
            Write::Initialize(value) => self.put(txn, target, value, true),
            Write::Delete => self.delete(txn, target),
        }
    }

    fn put(
        &self,
        txn: &mut Transaction<'_>,
        target: &Path,
        value: Value,
        only_if_absent: bool,
    ) -> Result<bool, DriverError> {
        let segments = target.segments();
        if let Some((_, parent)) = segments.split_last() {
            if !matches!(self.read_node(txn, parent)?, Some(Value::Object(_))) {
                log::debug!("Ignoring write to {target}: parent does not exist");
                return Ok(false);
            }
        }
        if only_if_absent && self.read_node(txn, segments)?.is_some() {
            return Ok(false);
        }

        let mut residual = value;
        let mut fragments = match self.format {
            StorageFormat::Single => Vec::new(),
            StorageFormat::Fragmented => {
                let mut parts =
                    self.surgeon
                        .scatter(&Reference::root(), &Reference::node(target.clone()), &mut residual)?;
                parts.pop();
                parts
            }
        };
        fragments.sort_by_key(|f| f.address.len());
        let mut keep: HashSet<Vec<String>> = fragments.iter().map(|f| f.address.clone()).collect();

        if self.is_fragment_address(segments) {
            if txn.get(&document_id_for(segments))?.is_none() {
                self.set_in_owner(txn, segments, PLACEHOLDER)?;
            }
            keep.insert(segments.to_vec());
            self.delete_fragments(txn, target, &keep)?;
            txn.replace(fragment_document(segments, residual))?;
        } else {
            self.set_in_owner(txn, segments, residual)?;
            self.delete_fragments(txn, target, &keep)?;
        }
        for fragment in fragments {
            txn.replace(fragment_document(&fragment.address, fragment.payload))?;
        }
        Ok(true)
    }

    fn delete(&self, txn: &mut Transaction<'_>, target: &Path) -> Result<bool, DriverError> {
        let segments = target.segments();
        if segments.is_empty() {
            return Err(DriverError::RootDeletion);
        }
        if self.read_node(txn, segments)?.is_none() {
            return Ok(false);
        }
        let (address, owner) = self.owner(txn, segments, segments.len() - 1)?;
        let owner_id = document_id(&owner).unwrap_or(ROOT_ID).to_string();
        txn.update(&owner_id, Vec::new(), vec![state_field(&segments[address.len()..])])?;
        self.delete_fragments(txn, target, &HashSet::new())?;
        Ok(true)
    }

    fn set_in_owner(&self, txn: &mut Transaction<'_>, segments: &[String], value: Value) -> Result<(), DriverError> {
        let limit = segments.len().saturating_sub(1);
        let (address, owner) = self.owner(txn, segments, limit)?;
        let owner_id = document_id(&owner).unwrap_or(ROOT_ID).to_string();
        txn.update(&owner_id, vec![(state_field(&segments[address.len()..]), value)], Vec::new())?;
        Ok(())
    }

    /// Delete fragments at or below `target` that are not in `keep`.
    fn delete_fragments(
        &self,
        txn: &mut Transaction<'_>,
        target: &Path,
        keep: &HashSet<Vec<String>>,
    ) -> Result<(), DriverError> {
        let segments = target.segments();
        if self.format == StorageFormat::Single
            || !(self.is_fragment_address(segments) || self.surgeon.has_graft_points_within(target))
        {
            return Ok(());
        }
        for document in txn.all()? {
            let Some(id) = document_id(&document).map(str::to_string) else {
                continue;
            };
            if id == ROOT_ID {
                continue;
            }
            let address = document_address(&document)?;
            if address.starts_with(segments) && !keep.contains(&address) {
                txn.delete(&id)?;
            }
        }
        Ok(())
    }
}

// ─── Events ───────────────────────────────────────────────────────────

/// A downstream update rebuilt from a committed event.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Replace(Reference, Value),
    Delete(Reference),
}

/// What one committed event means for the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Translated {
    pub revision: Option<u64>,
    /// The root document itself was inserted, replaced or deleted.
    pub layout_changed: bool,
    pub updates: Vec<Update>,
}

#[derive(Debug)]
enum Item {
    Put(Vec<String>, Value),
    Remove(Vec<String>),
}

impl Item {
    fn path(&self) -> &[String] {
        match self {
            Item::Put(path, _) | Item::Remove(path) => path,
        }
    }
}

fn parse_fragment_id(id: &str) -> Result<Vec<String>, DriverError> {
    serde_json::from_str(id).map_err(|e| DriverError::malformed(id, e.to_string()))
}

fn state_relative(field: &[String]) -> Option<&[String]> {
    match field.split_first() {
        Some((first, rest)) if first == STATE_FIELD => Some(rest),
        _ => None,
    }
}

/// Turn the document changes of `event` into tree updates.
///
/// Changes are stably sorted by path length. A change below an earlier
/// replaced subtree is grafted into it, a change below an earlier deleted
/// subtree is dropped, and anything else starts a new update.
pub fn translate(event: &ChangeEvent) -> Result<Translated, DriverError> {
    let mut items = Vec::new();
    let mut revision = None;
    let mut layout_changed = false;

    for change in &event.changes {
        match change {
            Change::Insert { document } | Change::Replace { document } => {
                if document_id(document) == Some(ROOT_ID) {
                    layout_changed = true;
                    revision = revision_of(document).ok().or(revision);
                } else {
                    let fragment = fragment_of(document)?;
                    items.push(Item::Put(fragment.address, fragment.payload));
                }
            }
            Change::Update {
                id,
                updated,
                removed,
                document,
            } => {
                let base = if id == ROOT_ID {
                    revision = Some(revision_of(document)?);
                    Vec::new()
                } else {
                    document_address(document)?
                };
                for (field, value) in updated {
                    if let Some(relative) = state_relative(field) {
                        items.push(Item::Put([base.as_slice(), relative].concat(), value.clone()));
                    }
                }
                for field in removed {
                    if let Some(relative) = state_relative(field) {
                        items.push(Item::Remove([base.as_slice(), relative].concat()));
                    }
                }
            }
            Change::Delete { id } => {
                if id == ROOT_ID {
                    layout_changed = true;
                } else {
                    items.push(Item::Remove(parse_fragment_id(id)?));
                }
            }
        }
    }

    items.sort_by_key(|item| item.path().len());
    let mut roots: Vec<Item> = Vec::new();
    for item in items {
        let Some(index) = roots.iter().position(|r| item.path().starts_with(r.path())) else {
            roots.push(item);
            continue;
        };
        let Item::Put(root_path, root_value) = &mut roots[index] else {
            // Below a deleted subtree
            continue;
        };
        let relative = item.path()[root_path.len()..].to_vec();
        match item {
            Item::Put(_, value) => graft(root_value, &relative, value)?,
            Item::Remove(path) => match relative.split_last() {
                Some((key, parent)) => {
                    if let Some(container) = node::container_mut(root_value, parent) {
                        container.remove(key);
                    }
                }
                None => roots[index] = Item::Remove(path),
            },
        }
    }

    let updates = roots
        .into_iter()
        .map(|item| match item {
            Item::Put(path, value) => Update::Replace(Reference::node(Path::of(path)), value),
            Item::Remove(path) => Update::Delete(Reference::node(Path::of(path))),
        })
        .collect();
    Ok(Translated {
        revision,
        layout_changed,
        updates,
    })
}
