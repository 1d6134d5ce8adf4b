//! Files and directories held by [`MemoryFs`](crate::MemoryFs).

use std::collections::BTreeMap;
use std::time::SystemTime;

use oxdokan_core::{FileAttributes, FileInformation, FileTimes, FindData};

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    File { data: Vec<u8> },
    /// Children by folded name, mapping to the name as created.
    Directory { children: BTreeMap<String, String> },
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub name: String,
    pub attributes: FileAttributes,
    pub created: SystemTime,
    pub accessed: SystemTime,
    pub written: SystemTime,
    /// Stable file id reported as `FileIndex`.
    pub index: u64,
    pub kind: NodeKind,
}

impl Node {
    pub fn file(name: &str, attributes: FileAttributes, index: u64) -> Self {
        Self::new(name, file_attributes(attributes), index, NodeKind::File { data: Vec::new() })
    }

    pub fn directory(name: &str, attributes: FileAttributes, index: u64) -> Self {
        let attributes = (attributes - FileAttributes::NORMAL) | FileAttributes::DIRECTORY;
        Self::new(
            name,
            attributes,
            index,
            NodeKind::Directory {
                children: BTreeMap::new(),
            },
        )
    }

    fn new(name: &str, attributes: FileAttributes, index: u64, kind: NodeKind) -> Self {
        let now = SystemTime::now();
        Self {
            name: name.to_string(),
            attributes,
            created: now,
            accessed: now,
            written: now,
            index,
            kind,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    /// Bytes of file content; zero for directories.
    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File { data } => data.len() as u64,
            NodeKind::Directory { .. } => 0,
        }
    }

    pub fn children(&self) -> Option<&BTreeMap<String, String>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut BTreeMap<String, String>> {
        match &mut self.kind {
            NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    pub fn data(&self) -> Option<&Vec<u8>> {
        match &self.kind {
            NodeKind::File { data } => Some(data),
            NodeKind::Directory { .. } => None,
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut Vec<u8>> {
        match &mut self.kind {
            NodeKind::File { data } => Some(data),
            NodeKind::Directory { .. } => None,
        }
    }

    /// Replace attributes, keeping the directory bit in step with the kind.
    ///
    /// An empty set means "leave unchanged".
    pub fn set_attributes(&mut self, attributes: FileAttributes) {
        if attributes.is_empty() {
            return;
        }
        self.attributes = if self.is_directory() {
            (attributes - FileAttributes::NORMAL) | FileAttributes::DIRECTORY
        } else {
            file_attributes(attributes)
        };
    }

    pub fn set_times(&mut self, times: &FileTimes) {
        if let Some(created) = times.creation_time {
            self.created = created;
        }
        if let Some(accessed) = times.last_access_time {
            self.accessed = accessed;
        }
        if let Some(written) = times.last_write_time {
            self.written = written;
        }
    }

    pub fn touch(&mut self) {
        let now = SystemTime::now();
        self.accessed = now;
        self.written = now;
    }

    pub fn info(&self) -> FileInformation {
        FileInformation {
            attributes: self.attributes,
            creation_time: self.created,
            last_access_time: self.accessed,
            last_write_time: self.written,
            file_size: self.size(),
            number_of_links: 1,
            file_index: self.index,
        }
    }

    pub fn find_data(&self) -> FindData {
        FindData::from_info(self.name.clone(), &self.info())
    }
}

/// `NORMAL` is only valid on its own.
fn file_attributes(attributes: FileAttributes) -> FileAttributes {
    let attributes = attributes - FileAttributes::DIRECTORY;
    if attributes.is_empty() {
        FileAttributes::NORMAL
    } else if attributes == FileAttributes::NORMAL {
        attributes
    } else {
        attributes - FileAttributes::NORMAL
    }
}
