//! A volume that lives entirely in memory.
//!
//! The tree is a map from case-folded path to [`Node`]; directories keep the
//! names of their children so listing and renames never scan the whole map.
//! Create follows the NT dispositions the way Windows applies them to files
//! and directories, and deletion is deferred to cleanup of a handle flagged
//! delete-on-close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use oxdokan_core::{
    CreateAction, CreateDisposition, CreateOptions, CreateOutcome, CreateRequest, DiskSpace, DokanError, DokanFileSystem,
    DokanPath, DokanResult, FileAttributes, FileContext, FileInformation, FileSystemFlags, FileTimes,
    FillFindData, FillFindStreamData, NtStatus, OperationKind, OperationSet, StreamData, VolumeInformation,
    path::PathKey,
};
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::config::MemFsConfig;
use crate::locks::RangeLocks;
use crate::node::Node;

const ROOT_INDEX: u64 = 1;

struct Tree {
    nodes: HashMap<PathKey, Node>,
    /// Sum of file sizes.
    used: u64,
    case_sensitive: bool,
}

impl Tree {
    fn new(case_sensitive: bool) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            DokanPath::root().key(case_sensitive),
            Node::directory("", FileAttributes::empty(), ROOT_INDEX),
        );
        Self {
            nodes,
            used: 0,
            case_sensitive,
        }
    }

    fn key(&self, path: &DokanPath) -> PathKey {
        path.key(self.case_sensitive)
    }

    fn fold(&self, name: &str) -> String {
        if self.case_sensitive {
            name.to_string()
        } else {
            name.to_uppercase()
        }
    }

    fn get(&self, path: &DokanPath) -> Option<&Node> {
        self.nodes.get(&self.key(path))
    }

    fn node(&self, path: &DokanPath) -> DokanResult<&Node> {
        self.get(path)
            .ok_or_else(|| DokanError::not_found(path.to_string()))
    }

    fn node_mut(&mut self, path: &DokanPath) -> DokanResult<&mut Node> {
        let key = self.key(path);
        self.nodes
            .get_mut(&key)
            .ok_or_else(|| DokanError::not_found(path.to_string()))
    }

    /// The directory that would hold `path`.
    fn parent_of(&self, path: &DokanPath) -> DokanResult<DokanPath> {
        let parent = path
            .parent()
            .ok_or(DokanError::Status(NtStatus::ACCESS_DENIED))?;
        match self.get(&parent) {
            Some(node) if node.is_directory() => Ok(parent),
            _ => Err(DokanError::Status(NtStatus::OBJECT_PATH_NOT_FOUND)),
        }
    }

    /// Link `node` at `path`, replacing whatever was there.
    fn insert(&mut self, path: &DokanPath, node: Node) -> DokanResult<()> {
        let parent = self.parent_of(path)?;
        let folded = self.fold(&node.name);
        let name = node.name.clone();
        self.remove(path);
        self.used += node.size();
        let key = self.key(path);
        self.nodes.insert(key, node);
        if let Some(children) = self.node_mut(&parent)?.children_mut() {
            children.insert(folded, name);
        }
        Ok(())
    }

    /// Unlink `path` and everything below it.
    fn remove(&mut self, path: &DokanPath) -> Vec<Node> {
        let paths = self.subtree(path);
        let mut removed = Vec::with_capacity(paths.len());
        for each in paths {
            let key = self.key(&each);
            if let Some(node) = self.nodes.remove(&key) {
                self.used = self.used.saturating_sub(node.size());
                removed.push(node);
            }
        }
        if !removed.is_empty()
            && let (Some(parent), Some(name)) = (path.parent(), path.file_name())
        {
            let folded = self.fold(name);
            let key = self.key(&parent);
            if let Some(children) = self.nodes.get_mut(&key).and_then(Node::children_mut) {
                children.remove(&folded);
            }
        }
        removed
    }

    /// `path` followed by all its descendants, parents first.
    fn subtree(&self, path: &DokanPath) -> Vec<DokanPath> {
        let mut out = Vec::new();
        let mut pending = vec![path.clone()];
        while let Some(next) = pending.pop() {
            let Some(node) = self.get(&next) else {
                continue;
            };
            if let Some(children) = node.children() {
                pending.extend(children.values().filter_map(|name| next.join(name).ok()));
            }
            out.push(next);
        }
        out
    }

    fn child_paths(&self, dir: &DokanPath) -> Vec<DokanPath> {
        self.get(dir)
            .and_then(Node::children)
            .map(|children| children.values().filter_map(|name| dir.join(name).ok()).collect())
            .unwrap_or_default()
    }
}

/// In-memory [`DokanFileSystem`].
pub struct MemoryFs {
    config: MemFsConfig,
    tree: RwLock<Tree>,
    locks: RangeLocks,
    next_index: AtomicU64,
}

impl MemoryFs {
    pub fn new(config: MemFsConfig) -> Self {
        Self {
            tree: RwLock::new(Tree::new(config.case_sensitive)),
            config,
            locks: RangeLocks::new(),
            next_index: AtomicU64::new(ROOT_INDEX + 1),
        }
    }

    pub fn config(&self) -> &MemFsConfig {
        &self.config
    }

    /// Bytes of file content currently stored.
    pub fn used_bytes(&self) -> u64 {
        self.tree.read().used
    }

    /// Files and directories, the root included.
    pub fn entry_count(&self) -> usize {
        self.tree.read().nodes.len()
    }

    pub fn exists(&self, path: &str) -> bool {
        DokanPath::parse(path).is_ok_and(|path| self.tree.read().get(&path).is_some())
    }

    /// Copy of a file's content.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let path = DokanPath::parse(path).ok()?;
        self.tree.read().get(&path)?.data().cloned()
    }

    /// Create a directory and any missing parents, bypassing read-only mode.
    pub fn insert_directory(&self, path: &str) -> DokanResult<()> {
        let path = DokanPath::parse(path)?;
        let mut tree = self.tree.write();
        let mut current = DokanPath::root();
        for component in path.components() {
            current = current.join(component)?;
            match tree.get(&current) {
                Some(node) if node.is_directory() => continue,
                Some(_) => return Err(DokanError::Status(NtStatus::NOT_A_DIRECTORY)),
                None => {
                    let node = Node::directory(component, FileAttributes::empty(), self.index());
                    tree.insert(&current, node)?;
                }
            }
        }
        Ok(())
    }

    /// Create or replace a file with `data`, bypassing read-only mode.
    pub fn insert_file(&self, path: &str, data: &[u8]) -> DokanResult<()> {
        let parsed = DokanPath::parse(path)?;
        let name = parsed
            .file_name()
            .ok_or(DokanError::Status(NtStatus::FILE_IS_A_DIRECTORY))?
            .to_string();
        if let Some(parent) = parsed.parent() {
            self.insert_directory(parent.as_str())?;
        }
        let mut node = Node::file(&name, FileAttributes::ARCHIVE, self.index());
        if let Some(content) = node.data_mut() {
            content.extend_from_slice(data);
        }
        self.tree.write().insert(&parsed, node)
    }

    fn index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_writable(&self) -> DokanResult<()> {
        if self.config.read_only {
            Err(DokanError::WriteProtected)
        } else {
            Ok(())
        }
    }

    /// Reserve room for a file growing from `old` to `new` bytes.
    fn reserve(&self, tree: &Tree, old: u64, new: u64) -> DokanResult<()> {
        let growth = new.saturating_sub(old);
        if growth > 0 && tree.used.saturating_add(growth) > self.config.capacity {
            debug!(used = tree.used, growth, capacity = self.config.capacity, "Volume full");
            return Err(DokanError::Status(NtStatus::DISK_FULL));
        }
        Ok(())
    }

    /// Resize a file's content, keeping the used-bytes count in step.
    fn resize(&self, path: &DokanPath, length: u64) -> DokanResult<()> {
        let length_usize = usize::try_from(length).map_err(|_| DokanError::Status(NtStatus::DISK_FULL))?;
        let mut tree = self.tree.write();
        let old = tree.node(path)?.size();
        self.reserve(&tree, old, length)?;
        let node = tree.node_mut(path)?;
        let data = node
            .data_mut()
            .ok_or(DokanError::Status(NtStatus::FILE_IS_A_DIRECTORY))?;
        data.resize(length_usize, 0);
        node.touch();
        tree.used = tree.used - old + length;
        Ok(())
    }

    fn create_new(
        &self,
        tree: &mut Tree,
        path: &DokanPath,
        request: &CreateRequest,
        directory: bool,
    ) -> DokanResult<CreateOutcome> {
        use CreateDisposition::{Create, Open, OpenIf, Overwrite, OverwriteIf, Supersede};

        let allowed = if directory {
            match request.disposition {
                Create | OpenIf => true,
                Open => false,
                Overwrite | OverwriteIf | Supersede => return Err(DokanError::Status(NtStatus::ACCESS_DENIED)),
            }
        } else {
            matches!(request.disposition, Create | OpenIf | OverwriteIf | Supersede)
        };
        tree.parent_of(path)?;
        if !allowed {
            return Err(DokanError::not_found(path.to_string()));
        }
        self.ensure_writable()?;

        let name = path.file_name().unwrap_or_default();
        let node = if directory {
            Node::directory(name, request.attributes, self.index())
        } else {
            Node::file(name, request.attributes, self.index())
        };
        tree.insert(path, node)?;
        debug!(%path, directory, "Created");
        Ok(CreateOutcome::created(directory))
    }

    fn open_existing_file(
        &self,
        tree: &mut Tree,
        path: &DokanPath,
        request: &CreateRequest,
    ) -> DokanResult<CreateOutcome> {
        let directory = request.options.contains(CreateOptions::DIRECTORY_FILE);
        match request.disposition {
            CreateDisposition::Supersede => {
                self.ensure_writable()?;
                let name = path.file_name().unwrap_or_default();
                let node = if directory {
                    Node::directory(name, request.attributes, self.index())
                } else {
                    Node::file(name, request.attributes, self.index())
                };
                let replaced = tree.node(path)?.index;
                tree.insert(path, node)?;
                self.locks.forget(replaced);
                Ok(CreateOutcome {
                    is_directory: directory,
                    action: CreateAction::Superseded,
                })
            }
            _ if directory => Err(DokanError::Status(NtStatus::NOT_A_DIRECTORY)),
            CreateDisposition::Create => Err(DokanError::Status(NtStatus::OBJECT_NAME_COLLISION)),
            CreateDisposition::Open | CreateDisposition::OpenIf => Ok(CreateOutcome::opened(false)),
            CreateDisposition::Overwrite | CreateDisposition::OverwriteIf => {
                self.ensure_writable()?;
                let node = tree.node_mut(path)?;
                let old = node.size();
                if let Some(data) = node.data_mut() {
                    data.clear();
                }
                node.set_attributes(request.attributes);
                node.touch();
                tree.used = tree.used.saturating_sub(old);
                Ok(CreateOutcome {
                    is_directory: false,
                    action: CreateAction::Overwritten,
                })
            }
        }
    }

    fn file_index(&self, path: &DokanPath) -> DokanResult<u64> {
        Ok(self.tree.read().node(path)?.index)
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new(MemFsConfig::default())
    }
}

impl DokanFileSystem for MemoryFs {
    fn supported_operations(&self) -> OperationSet {
        let full = OperationSet::all()
            .without(OperationKind::FindFilesWithPattern)
            .without(OperationKind::GetFileSecurity)
            .without(OperationKind::SetFileSecurity);
        if self.config.read_only {
            OperationSet::read_only()
                .iter()
                .filter(|kind| full.contains(*kind))
                .collect()
        } else {
            full
        }
    }

    fn create(&self, path: &DokanPath, request: &CreateRequest, _ctx: &FileContext<'_>) -> DokanResult<CreateOutcome> {
        let want_directory = request.options.contains(CreateOptions::DIRECTORY_FILE);
        let want_file = request.options.contains(CreateOptions::NON_DIRECTORY_FILE);
        if want_directory && want_file {
            return Err(DokanError::Status(NtStatus::INVALID_PARAMETER));
        }

        let mut tree = self.tree.write();
        let existing = tree.get(path).map(Node::is_directory);
        trace!(%path, disposition = %request.disposition, ?existing, "Create");
        match existing {
            Some(true) => {
                if want_file {
                    return Err(DokanError::Status(NtStatus::FILE_IS_A_DIRECTORY));
                }
                match request.disposition {
                    CreateDisposition::Create => Err(DokanError::Status(NtStatus::OBJECT_NAME_COLLISION)),
                    CreateDisposition::Open | CreateDisposition::OpenIf => Ok(CreateOutcome::opened(true)),
                    _ => Err(DokanError::Status(NtStatus::ACCESS_DENIED)),
                }
            }
            Some(false) => self.open_existing_file(&mut tree, path, request),
            None => self.create_new(&mut tree, path, request, want_directory),
        }
    }

    fn cleanup(&self, path: &DokanPath, ctx: &FileContext<'_>) {
        let mut tree = self.tree.write();
        let Some(index) = tree.get(path).map(|node| node.index) else {
            return;
        };
        let released = self.locks.release_owner(index, ctx.handle());
        if released > 0 {
            trace!(%path, released, "Released range locks");
        }
        if !ctx.delete_on_close() {
            return;
        }
        if tree
            .get(path)
            .and_then(Node::children)
            .is_some_and(|children| !children.is_empty())
        {
            warn!(%path, "Directory gained entries before cleanup; not deleting");
            return;
        }
        tree.remove(path);
        self.locks.forget(index);
        debug!(%path, "Deleted on close");
    }

    fn read(&self, path: &DokanPath, buffer: &mut [u8], offset: u64, ctx: &FileContext<'_>) -> DokanResult<usize> {
        let tree = self.tree.read();
        let node = tree.node(path)?;
        let data = node
            .data()
            .ok_or(DokanError::Status(NtStatus::FILE_IS_A_DIRECTORY))?;
        self.locks
            .check(node.index, ctx.handle(), offset, buffer.len() as u64)?;
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let count = buffer.len().min(data.len() - start);
        buffer[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    fn write(&self, path: &DokanPath, data: &[u8], offset: u64, ctx: &FileContext<'_>) -> DokanResult<usize> {
        self.ensure_writable()?;
        let mut tree = self.tree.write();
        let node = tree.node(path)?;
        let size = node.size();
        let index = node.index;

        let start = if ctx.write_to_end_of_file() { size } else { offset };
        // Paging I/O never extends the file.
        let data = if ctx.paging_io() {
            if start >= size {
                return Ok(0);
            }
            let room = usize::try_from(size - start).unwrap_or(usize::MAX);
            &data[..data.len().min(room)]
        } else {
            data
        };
        self.locks.check(index, ctx.handle(), start, data.len() as u64)?;

        let end = start.saturating_add(data.len() as u64);
        let new_size = size.max(end);
        self.reserve(&tree, size, new_size)?;
        let (Ok(start), Ok(end)) = (usize::try_from(start), usize::try_from(end)) else {
            return Err(DokanError::Status(NtStatus::DISK_FULL));
        };

        let node = tree.node_mut(path)?;
        let content = node
            .data_mut()
            .ok_or(DokanError::Status(NtStatus::FILE_IS_A_DIRECTORY))?;
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);
        node.touch();
        tree.used = tree.used - size + new_size;
        Ok(data.len())
    }

    fn flush(&self, path: &DokanPath, _ctx: &FileContext<'_>) -> DokanResult<()> {
        self.tree.read().node(path).map(|_| ())
    }

    fn get_file_information(&self, path: &DokanPath, _ctx: &FileContext<'_>) -> DokanResult<FileInformation> {
        Ok(self.tree.read().node(path)?.info())
    }

    fn find_files(&self, path: &DokanPath, fill: &mut FillFindData<'_>, _ctx: &FileContext<'_>) -> DokanResult<()> {
        let entries: Vec<_> = {
            let tree = self.tree.read();
            if !tree.node(path)?.is_directory() {
                return Err(DokanError::Status(NtStatus::NOT_A_DIRECTORY));
            }
            tree.child_paths(path)
                .iter()
                .filter_map(|child| tree.get(child).map(Node::find_data))
                .collect()
        };
        for entry in &entries {
            fill(entry)?;
        }
        Ok(())
    }

    fn set_file_attributes(&self, path: &DokanPath, attributes: FileAttributes, _ctx: &FileContext<'_>) -> DokanResult<()> {
        self.ensure_writable()?;
        self.tree.write().node_mut(path)?.set_attributes(attributes);
        Ok(())
    }

    fn set_file_time(&self, path: &DokanPath, times: &FileTimes, _ctx: &FileContext<'_>) -> DokanResult<()> {
        self.ensure_writable()?;
        self.tree.write().node_mut(path)?.set_times(times);
        Ok(())
    }

    fn delete_file(&self, path: &DokanPath, _ctx: &FileContext<'_>) -> DokanResult<()> {
        self.ensure_writable()?;
        let tree = self.tree.read();
        let node = tree.node(path)?;
        if node.is_directory() {
            return Err(DokanError::Status(NtStatus::ACCESS_DENIED));
        }
        if node.attributes.contains(FileAttributes::READONLY) {
            return Err(DokanError::Status(NtStatus::CANNOT_DELETE));
        }
        Ok(())
    }

    fn delete_directory(&self, path: &DokanPath, _ctx: &FileContext<'_>) -> DokanResult<()> {
        self.ensure_writable()?;
        if path.is_root() {
            return Err(DokanError::Status(NtStatus::ACCESS_DENIED));
        }
        let tree = self.tree.read();
        let children = tree
            .node(path)?
            .children()
            .ok_or(DokanError::Status(NtStatus::NOT_A_DIRECTORY))?;
        if !children.is_empty() {
            return Err(DokanError::Status(NtStatus::DIRECTORY_NOT_EMPTY));
        }
        Ok(())
    }

    fn move_file(
        &self,
        path: &DokanPath,
        new_path: &DokanPath,
        replace_if_existing: bool,
        _ctx: &FileContext<'_>,
    ) -> DokanResult<()> {
        self.ensure_writable()?;
        if path.is_root() || new_path.is_root() {
            return Err(DokanError::Status(NtStatus::ACCESS_DENIED));
        }
        let mut tree = self.tree.write();
        let cs = tree.case_sensitive;
        tree.node(path)?;
        let same_entry = tree.key(path) == tree.key(new_path);
        if !same_entry && new_path.is_within(path, cs) {
            return Err(DokanError::Status(NtStatus::INVALID_PARAMETER));
        }
        tree.parent_of(new_path)?;

        if !same_entry && let Some(target) = tree.get(new_path) {
            if !replace_if_existing {
                return Err(DokanError::Status(NtStatus::OBJECT_NAME_COLLISION));
            }
            if target.is_directory() {
                return Err(DokanError::Status(NtStatus::ACCESS_DENIED));
            }
            let index = target.index;
            tree.remove(new_path);
            self.locks.forget(index);
        }

        let moved: Vec<(DokanPath, Node)> = tree
            .subtree(path)
            .into_iter()
            .filter_map(|old| {
                let key = tree.key(&old);
                let node = tree.nodes.remove(&key)?;
                let new = old.rebase(path, new_path, cs)?;
                Some((new, node))
            })
            .collect();

        if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
            let folded = tree.fold(name);
            if let Some(children) = tree.node_mut(&parent)?.children_mut() {
                children.remove(&folded);
            }
        }
        for (new, mut node) in moved {
            if new == *new_path {
                node.name = new_path.file_name().unwrap_or_default().to_string();
            }
            let key = tree.key(&new);
            tree.nodes.insert(key, node);
        }
        let new_parent = tree.parent_of(new_path)?;
        let name = new_path.file_name().unwrap_or_default().to_string();
        let folded = tree.fold(&name);
        if let Some(children) = tree.node_mut(&new_parent)?.children_mut() {
            children.insert(folded, name);
        }
        debug!(from = %path, to = %new_path, "Moved");
        Ok(())
    }

    fn set_end_of_file(&self, path: &DokanPath, length: u64, _ctx: &FileContext<'_>) -> DokanResult<()> {
        self.ensure_writable()?;
        self.resize(path, length)
    }

    fn set_allocation_size(&self, path: &DokanPath, size: u64, _ctx: &FileContext<'_>) -> DokanResult<()> {
        self.ensure_writable()?;
        let current = self.tree.read().node(path)?.size();
        // Allocation never holds less than the file; growing it is a no-op here.
        if size < current {
            self.resize(path, size)
        } else {
            Ok(())
        }
    }

    fn lock_file(&self, path: &DokanPath, offset: u64, length: u64, ctx: &FileContext<'_>) -> DokanResult<()> {
        let index = self.file_index(path)?;
        self.locks.lock(index, ctx.handle(), offset, length)
    }

    fn unlock_file(&self, path: &DokanPath, offset: u64, length: u64, ctx: &FileContext<'_>) -> DokanResult<()> {
        let index = self.file_index(path)?;
        self.locks.unlock(index, ctx.handle(), offset, length)
    }

    fn get_disk_free_space(&self, _ctx: &FileContext<'_>) -> DokanResult<DiskSpace> {
        let free = self.config.capacity.saturating_sub(self.used_bytes());
        Ok(DiskSpace {
            free_bytes_available: free,
            total_bytes: self.config.capacity,
            total_free_bytes: free,
        })
    }

    fn get_volume_information(&self, _ctx: &FileContext<'_>) -> DokanResult<VolumeInformation> {
        let mut flags = FileSystemFlags::CASE_PRESERVED_NAMES | FileSystemFlags::UNICODE_ON_DISK;
        if self.config.case_sensitive {
            flags |= FileSystemFlags::CASE_SENSITIVE_SEARCH;
        }
        if self.config.read_only {
            flags |= FileSystemFlags::READ_ONLY_VOLUME;
        }
        Ok(VolumeInformation {
            volume_name: self.config.volume_label.clone(),
            serial_number: self.config.serial_number,
            file_system_flags: flags,
            ..VolumeInformation::default()
        })
    }

    fn mounted(&self, mount_point: &str, _ctx: &FileContext<'_>) -> DokanResult<()> {
        info!(mount_point, entries = self.entry_count(), "Memory volume mounted");
        Ok(())
    }

    fn unmounted(&self, _ctx: &FileContext<'_>) -> DokanResult<()> {
        info!(used_bytes = self.used_bytes(), "Memory volume unmounted");
        Ok(())
    }

    /// Only the unnamed data stream exists.
    fn find_streams(&self, path: &DokanPath, fill: &mut FillFindStreamData<'_>, _ctx: &FileContext<'_>) -> DokanResult<()> {
        let size = {
            let tree = self.tree.read();
            let node = tree.node(path)?;
            if node.is_directory() {
                return Ok(());
            }
            node.size()
        };
        fill(&StreamData {
            stream_name: "::$DATA".to_string(),
            stream_size: i64::try_from(size).unwrap_or(i64::MAX),
        })
    }
}
