//! Bind mount translation.

use topolab_common::{TopoError, TopoResult};
use topolab_oci::runtime::Mount;

/// Translate `source:destination[:opt,opt]` binds into mount entries.
///
/// `base_options` are prepended to each mount's options; the third
/// segment, when present, adds comma-separated options after them.
///
/// # Errors
///
/// Returns [`TopoError::InvalidBind`] for a bind without a `:` separator.
pub fn convert_mounts(binds: &[String], base_options: &[&str]) -> TopoResult<Vec<Mount>> {
    let mounts = binds
        .iter()
        .map(|bind| convert_mount(bind, base_options))
        .collect::<TopoResult<Vec<_>>>()?;
    tracing::debug!(?binds, count = mounts.len(), "translated bind mounts");
    Ok(mounts)
}

fn convert_mount(bind: &str, base_options: &[&str]) -> TopoResult<Mount> {
    let mut parts = bind.splitn(3, ':');
    let (Some(source), Some(destination)) = (parts.next(), parts.next()) else {
        return Err(TopoError::InvalidBind {
            bind: bind.to_string(),
        });
    };

    let mut mount = Mount::bind(source, destination);
    mount.options = base_options.iter().map(ToString::to_string).collect();
    if let Some(options) = parts.next() {
        mount
            .options
            .extend(options.split(',').filter(|o| !o.is_empty()).map(str::to_string));
    }
    Ok(mount)
}
