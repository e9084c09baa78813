use std::path::PathBuf;

use crate::{
    bootstrap::Node,
    builder::{Builder, BuilderError},
    executor::SshTarget,
};

use super::assert_not_none;

/// Assembles a bootstrap [Node]. The hostname used to prefix the node
/// output defaults to the SSH host.
#[derive(Debug, Default)]
pub struct NodeBuilder {
    hostname: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    key_path: Option<PathBuf>,
}

impl NodeBuilder {
    pub fn new() -> NodeBuilder {
        NodeBuilder::default()
    }

    pub fn with_hostname(mut self, hostname: String) -> NodeBuilder {
        self.hostname = Some(hostname);
        self
    }

    pub fn with_host(mut self, host: String) -> NodeBuilder {
        self.host = Some(host);
        self
    }

    pub fn with_port(mut self, port: u16) -> NodeBuilder {
        self.port = Some(port);
        self
    }

    pub fn with_user(mut self, user: String) -> NodeBuilder {
        self.user = Some(user);
        self
    }

    pub fn with_key_path(mut self, key_path: PathBuf) -> NodeBuilder {
        self.key_path = Some(key_path);
        self
    }
}

impl Builder<Node> for NodeBuilder {
    fn try_build(self) -> Result<Node, BuilderError> {
        assert_not_none(stringify!(self.host), &self.host)?;
        assert_not_none(stringify!(self.user), &self.user)?;
        assert_not_none(stringify!(self.key_path), &self.key_path)?;
        if self.port == Some(0) {
            return Err(BuilderError::InvalidValue("port 0 is not usable".to_string()));
        }

        let host = self.host.unwrap_or_default();
        Ok(Node {
            hostname: self.hostname.unwrap_or_else(|| host.clone()),
            target: SshTarget {
                host,
                port: self.port,
                user: self.user.unwrap_or_default(),
                key_path: self.key_path.unwrap_or_default(),
            },
        })
    }
}
