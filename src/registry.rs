use std::collections::HashMap;
use std::sync::OnceLock;

use crate::block::BlockHandle;
use crate::util::SpinLockRW;
use crate::{Error, Object, Result};

type Factory = Box<dyn Fn(&[Object]) -> Result<BlockHandle> + Send + Sync>;

fn registry() -> &'static SpinLockRW<HashMap<String, Factory>> {
    static REGISTRY: OnceLock<SpinLockRW<HashMap<String, Factory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| SpinLockRW::new(HashMap::new()))
}

/// Validate a registry path: `/`-rooted, non-empty segments of word
/// characters and dashes.
fn check_path(path: &str) -> Result<()> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| Error::PluginPath(format!("\"{}\" must start with /", path)))?;
    if rest.is_empty() {
        return Err(Error::PluginPath("path has no segments".into()));
    }
    for segment in rest.split('/') {
        if segment.is_empty() {
            return Err(Error::PluginPath(format!("\"{}\" has an empty segment", path)));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::PluginPath(format!(
                "\"{}\" has an invalid segment \"{}\"",
                path, segment
            )));
        }
    }
    Ok(())
}

/// The process-wide block factory registry: a path such as
/// `/blocks/network_sink` maps to a factory taking opaque arguments.
/// Writers are registration hooks at load time; readers are topology
/// commits, so the map sits behind the reader-optimized spinlock.
#[derive(Debug)]
pub struct BlockRegistry;

impl BlockRegistry {
    pub fn register(
        path: &str,
        factory: impl Fn(&[Object]) -> Result<BlockHandle> + Send + Sync + 'static,
    ) -> Result<()> {
        check_path(path)?;
        registry()
            .write()
            .insert(path.to_owned(), Box::new(factory));
        Ok(())
    }

    pub fn contains(path: &str) -> bool {
        registry().read().contains_key(path)
    }

    /// Instantiate a block through its registered factory.
    pub fn make(path: &str, args: &[Object]) -> Result<BlockHandle> {
        check_path(path)?;
        let guard = registry().read();
        let factory = guard
            .get(path)
            .ok_or_else(|| Error::PluginRegistry(format!("no factory at \"{}\"", path)))?;
        factory(args)
    }
}
