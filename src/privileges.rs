// Dropping root after the well-known port is bound.

use anyhow::Result;

/// Switches the process to `username` and that user's primary group, clearing supplementary
/// groups first.
#[cfg(unix)]
pub fn drop_privileges(username: &str) -> Result<()> {
    use anyhow::{anyhow, Context};
    use nix::unistd::{setgid, setuid, Group, User};

    let user = User::from_name(username)
        .with_context(|| format!("Failed to look up user {username}"))?
        .ok_or_else(|| anyhow!("No such user: {username}"))?;

    #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "redox", target_os = "haiku")))]
    nix::unistd::setgroups(&[]).context("Could not clear supplementary groups")?;
    setgid(user.gid).context("Could not set effective group id")?;
    setuid(user.uid).context("Could not set effective user id")?;

    let group = match Group::from_gid(user.gid) {
        Ok(Some(group)) => group.name,
        _ => user.gid.to_string(),
    };
    log::info!("Dropped root privileges, running as {}:{}", user.name, group);
    Ok(())
}

#[cfg(not(unix))]
pub fn drop_privileges(username: &str) -> Result<()> {
    anyhow::bail!("Cannot switch to user {username}: dropping privileges is only supported on unix")
}
