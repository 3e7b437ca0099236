//! Hosts-file block for suffixes mDNS cannot resolve.
//!
//! `.local` hosts resolve over loopback mDNS; anything else (the `.lab`
//! suffix by default) needs explicit entries. faa owns one delimited block
//! in the hosts file and rewrites it wholesale from the current routes
//! snapshot; every line outside the markers is preserved byte-for-byte.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

const BLOCK_START: &str = "# faa lab hosts start";
const BLOCK_END: &str = "# faa lab hosts end";

const DEFAULT_HOSTS_MODE: u32 = 0o644;

/// Hosts from the snapshot that belong in the hosts file: those carrying
/// one of the managed suffixes, restricted to hostname-safe characters.
/// Returned sorted ascending.
pub fn collect_managed_hosts(routes: &BTreeMap<String, u16>, suffixes: &[String]) -> Vec<String> {
    let mut hosts: Vec<String> = routes
        .keys()
        .filter(|host| suffixes.iter().any(|suffix| host.ends_with(suffix.as_str())))
        .filter(|host| is_safe_host(host))
        .cloned()
        .collect();
    hosts.sort();
    hosts
}

fn is_safe_host(host: &str) -> bool {
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Render the managed block: each host as a `127.0.0.1` and a `::1` line.
/// An empty host list renders as no block at all.
fn render_block(hosts: &[String]) -> String {
    if hosts.is_empty() {
        return String::new();
    }

    let mut block = String::from(BLOCK_START);
    block.push('\n');
    for host in hosts {
        block.push_str("127.0.0.1 ");
        block.push_str(host);
        block.push('\n');
        block.push_str("::1 ");
        block.push_str(host);
        block.push('\n');
    }
    block.push_str(BLOCK_END);
    block.push('\n');
    block
}

/// Remove any existing managed block from `content` and append the freshly
/// rendered one. Unmanaged content is untouched.
fn replace_block(content: &str, block: &str) -> String {
    let existing = match (content.find(BLOCK_START), content.find(BLOCK_END)) {
        (Some(start), Some(end)) if end > start => Some((start, end)),
        _ => None,
    };

    // Absent block and nothing to add: leave the file byte-identical.
    if block.is_empty() && existing.is_none() {
        return content.to_string();
    }

    let mut content = match existing {
        Some((start, end)) => {
            let mut after = &content[end + BLOCK_END.len()..];
            after = after.strip_prefix('\n').unwrap_or(after);
            format!("{}{}", &content[..start], after)
        }
        None => content.to_string(),
    };

    if block.is_empty() {
        let trimmed = content.trim_end_matches('\n');
        return format!("{trimmed}\n");
    }

    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(block);
    content
}

/// Rewrite the managed block of the hosts file at `path` to reflect
/// `hosts`. The replacement is atomic: the new content is written to a
/// sibling temp file carrying the original permissions and renamed into
/// place. A missing hosts file is treated as empty.
pub async fn sync_managed_block(path: &Path, hosts: &[String]) -> Result<()> {
    let (original, mode) = match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let mode = tokio::fs::metadata(path)
                .await
                .map(|meta| {
                    use std::os::unix::fs::PermissionsExt;
                    meta.permissions().mode() & 0o777
                })
                .unwrap_or(DEFAULT_HOSTS_MODE);
            (content, mode)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            (String::new(), DEFAULT_HOSTS_MODE)
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };

    let updated = replace_block(&original, &render_block(hosts));
    if updated == original {
        return Ok(());
    }

    let dir = path.parent().context("hosts file has no parent directory")?;
    let tmp = NamedTempFile::new_in(dir).context("failed to create temp hosts file")?;
    std::fs::write(tmp.path(), &updated).context("failed to write temp hosts file")?;
    std::fs::set_permissions(tmp.path(), {
        use std::os::unix::fs::PermissionsExt;
        std::fs::Permissions::from_mode(mode)
    })
    .context("failed to set temp hosts permissions")?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn routes(entries: &[(&str, u16)]) -> BTreeMap<String, u16> {
        entries
            .iter()
            .map(|(host, port)| (host.to_string(), *port))
            .collect()
    }

    fn lab() -> Vec<String> {
        vec![".lab".to_string()]
    }

    #[test]
    fn collects_only_managed_safe_hosts_sorted() {
        let routes = routes(&[
            ("zeta.lab", 1),
            ("app.local", 2),
            ("alpha.lab", 3),
            ("bad host.lab", 4),
        ]);
        let hosts = collect_managed_hosts(&routes, &lab());
        assert_eq!(hosts, ["alpha.lab", "zeta.lab"]);
    }

    #[test]
    fn renders_both_address_families() {
        let block = render_block(&["app.lab".to_string()]);
        assert_eq!(
            block,
            "# faa lab hosts start\n127.0.0.1 app.lab\n::1 app.lab\n# faa lab hosts end\n"
        );
    }

    #[test]
    fn empty_host_list_renders_nothing() {
        assert_eq!(render_block(&[]), "");
    }

    #[test]
    fn block_is_appended_to_untouched_content() {
        let content = "127.0.0.1 localhost\n";
        let updated = replace_block(content, &render_block(&["app.lab".to_string()]));
        assert!(updated.starts_with("127.0.0.1 localhost\n"));
        assert!(updated.contains("127.0.0.1 app.lab"));
        assert!(updated.contains("::1 app.lab"));
    }

    #[test]
    fn existing_block_is_replaced_exactly() {
        let content = "127.0.0.1 localhost\n# faa lab hosts start\n127.0.0.1 old.lab\n::1 old.lab\n# faa lab hosts end\n# trailing comment\n";
        let updated = replace_block(content, &render_block(&["new.lab".to_string()]));

        assert!(!updated.contains("old.lab"));
        assert!(updated.contains("127.0.0.1 new.lab"));
        assert!(updated.starts_with("127.0.0.1 localhost\n"));
        assert!(updated.contains("# trailing comment\n"));
        assert_eq!(updated.matches(BLOCK_START).count(), 1);
    }

    #[test]
    fn empty_snapshot_removes_the_block() {
        let content = "127.0.0.1 localhost\n# faa lab hosts start\n127.0.0.1 old.lab\n# faa lab hosts end\n";
        let updated = replace_block(content, "");
        assert_eq!(updated, "127.0.0.1 localhost\n");
    }

    #[tokio::test]
    async fn sync_is_a_no_op_without_block_or_hosts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();

        sync_managed_block(&path, &[]).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "127.0.0.1 localhost\n"
        );
    }

    #[tokio::test]
    async fn sync_writes_and_rewrites_the_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();

        sync_managed_block(&path, &["one.lab".to_string()]).await.unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(first.contains("127.0.0.1 one.lab"));

        sync_managed_block(&path, &["two.lab".to_string()]).await.unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert!(!second.contains("one.lab"));
        assert!(second.contains("two.lab"));
        assert!(second.starts_with("127.0.0.1 localhost\n"));
    }

    #[tokio::test]
    async fn sync_preserves_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o604)).unwrap();

        sync_managed_block(&path, &["app.lab".to_string()]).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o604);
    }

    #[tokio::test]
    async fn sync_on_missing_file_creates_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts");

        sync_managed_block(&path, &["app.lab".to_string()]).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(BLOCK_START));
    }
}
