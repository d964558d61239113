use crate::device::error::RequestError;
use crate::pin_map::Pin;
use crate::protocol::{Access, DirEntry, Stat};

/// Name of the node accepting structured messages.
pub const CONTROL_NODE: &str = "msg";

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const NODE_MODE: u32 = S_IFREG | 0o660;
const ROOT_INO: u32 = 1;

/// What an open handle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Pin(Pin),
    Control,
}

/// Identity of a connected peer, as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Attributes {
    mode: u32,
    uid: u32,
    gid: u32,
}

impl Attributes {
    fn permits(&self, cred: Credentials, access: Access) -> bool {
        if cred.is_root() {
            return true;
        }

        let shift = if cred.uid == self.uid {
            6
        } else if cred.gid == self.gid {
            3
        } else {
            0
        };
        let bits = (self.mode >> shift) & 0o7;

        (!access.reads() || bits & 0o4 != 0) && (!access.writes() || bits & 0o2 != 0)
    }
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    kind: NodeKind,
    attributes: Attributes,
}

/// The directory served at the mount point: one node per pin followed by the control node.
///
/// The node set is fixed at start-up. Only ownership changes afterwards.
#[derive(Debug, Clone)]
pub struct Namespace {
    root: Attributes,
    nodes: Vec<Node>,
}

impl Namespace {
    pub fn new(root_mode: u32, uid: u32, gid: u32) -> Self {
        let node = |name: String, kind| Node {
            name,
            kind,
            attributes: Attributes {
                mode: NODE_MODE,
                uid,
                gid,
            },
        };

        let mut nodes: Vec<Node> = Pin::all()
            .map(|pin| node(pin.to_string(), NodeKind::Pin(pin)))
            .collect();
        nodes.push(node(CONTROL_NODE.to_owned(), NodeKind::Control));

        Self {
            root: Attributes {
                mode: S_IFDIR | (root_mode & 0o7777),
                uid,
                gid,
            },
            nodes,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolves a path relative to the mount point. The empty path names the root.
    pub fn resolve(&self, path: &str) -> Result<NodeKind, RequestError> {
        let name = path.trim_start_matches('/');
        if name.is_empty() {
            return Ok(NodeKind::Root);
        }
        self.nodes
            .iter()
            .find(|node| node.name == name)
            .map(|node| node.kind)
            .ok_or(RequestError::NotFound)
    }

    /// Checks that a peer with `cred` may open `kind` for `access`.
    pub fn check_access(
        &self,
        kind: NodeKind,
        cred: Credentials,
        access: Access,
    ) -> Result<(), RequestError> {
        if self.attributes(kind).permits(cred, access) {
            Ok(())
        } else {
            Err(RequestError::PermissionDenied)
        }
    }

    /// Directory records for every node from `offset` on.
    pub fn entries(&self, offset: usize, stat: bool) -> impl Iterator<Item = DirEntry> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .skip(offset)
            .map(move |(index, node)| DirEntry {
                offset: index as u32,
                name: node.name.clone(),
                stat: stat.then(|| Stat {
                    ino: ROOT_INO + 1 + index as u32,
                    mode: node.attributes.mode,
                    uid: node.attributes.uid,
                    gid: node.attributes.gid,
                }),
            })
    }

    /// Hands every node, the root included, to `uid`/`gid`.
    pub fn set_owner(&mut self, uid: u32, gid: u32) {
        for attributes in std::iter::once(&mut self.root)
            .chain(self.nodes.iter_mut().map(|node| &mut node.attributes))
        {
            attributes.uid = uid;
            attributes.gid = gid;
        }
    }

    pub fn root_mode(&self) -> u32 {
        self.root.mode
    }

    fn attributes(&self, kind: NodeKind) -> &Attributes {
        let index = match kind {
            NodeKind::Root => return &self.root,
            NodeKind::Pin(pin) => pin.index(),
            NodeKind::Control => self.nodes.len() - 1,
        };
        &self.nodes[index].attributes
    }
}
