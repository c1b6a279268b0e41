//! Git mirror/checkout step (spec.md §4.D, §4.E): steps 0 and 1 of every
//! task are dispatched as `@sai-mirror <repo> <ref> <hash>` and
//! `@sai-checkout <repo> <ref> <hash>` sentinels rather than shell
//! lines. Grounded in the original builder's `git_helper_sh`: a bare
//! mirror is fetched once per (repo, hash) into a shared cache under
//! `<home>/git-mirror/`, and checkout clones from that local mirror
//! instead of the network.

use std::path::PathBuf;

pub const MIRROR_SENTINEL: &str = "@sai-mirror";
pub const CHECKOUT_SENTINEL: &str = "@sai-checkout";

pub struct GitStep {
    pub repo: String,
    pub git_ref: String,
    pub hash: String,
}

impl GitStep {
    /// Parses `"@sai-mirror <repo> <ref> <hash>"` / the checkout
    /// equivalent back into its three arguments.
    pub fn parse(command: &str) -> Option<GitStep> {
        let rest = command
            .strip_prefix(MIRROR_SENTINEL)
            .or_else(|| command.strip_prefix(CHECKOUT_SENTINEL))?;
        let mut parts = rest.split_whitespace();
        let repo = parts.next()?.to_string();
        let git_ref = parts.next()?.to_string();
        let hash = parts.next()?.to_string();
        Some(GitStep { repo, git_ref, hash })
    }

    fn mirror_dirname(&self) -> String {
        // Same sanitization idea as the original sai-builder: a
        // filesystem-safe stand-in for the remote url so distinct repos
        // never collide under one cache directory.
        self.repo
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect()
    }

    fn mirror_path(&self, home: &std::path::Path) -> PathBuf {
        home.join("git-mirror").join(self.mirror_dirname())
    }

    /// Shell line for the mirror step: fetch into the shared bare mirror,
    /// reusing it across tasks that share (repo, hash) (spec.md §4.D
    /// "mirror reuse").
    pub fn mirror_command(&self, home: &std::path::Path) -> String {
        let mirror = self.mirror_path(home);
        format!(
            "mkdir -p {mirror:?} && (test -d {mirror:?}/.git || git init --bare {mirror:?}) && \
             git -C {mirror:?} fetch {repo:?} +{git_ref}:ref-{hash}",
            mirror = mirror,
            repo = self.repo,
            git_ref = self.git_ref,
            hash = self.hash,
        )
    }

    /// Shell line for the checkout step: clone/fetch from the local
    /// mirror into the per-task build directory and hard-reset to the
    /// target hash.
    pub fn checkout_command(&self, home: &std::path::Path, build_dir: &std::path::Path) -> String {
        let mirror = self.mirror_path(home);
        format!(
            "mkdir -p {build_dir:?} && (test -d {build_dir:?}/.git || git -C {build_dir:?} init) && \
             git -C {build_dir:?} fetch {mirror:?} ref-{hash} && \
             git -C {build_dir:?} checkout -f {hash} && git -C {build_dir:?} clean -fdx",
            build_dir = build_dir,
            mirror = mirror,
            hash = self.hash,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mirror_sentinel_arguments() {
        let step = GitStep::parse("@sai-mirror git@host:repo.git refs/heads/main abc123").unwrap();
        assert_eq!(step.repo, "git@host:repo.git");
        assert_eq!(step.git_ref, "refs/heads/main");
        assert_eq!(step.hash, "abc123");
    }

    #[test]
    fn non_git_step_does_not_parse() {
        assert!(GitStep::parse("make test").is_none());
    }

    #[test]
    fn mirror_dirname_sanitizes_punctuation() {
        let step = GitStep::parse("@sai-checkout https://example.com/a/b.git main abc").unwrap();
        assert!(step.mirror_dirname().chars().all(|c| c.is_alphanumeric() || c == '.' || c == '-' || c == '_'));
    }
}
