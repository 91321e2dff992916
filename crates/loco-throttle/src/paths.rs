//! Portable path resolution
//!
//! Configuration refers to files through prefixed, machine-independent paths
//! such as `preference:connections/dccex.json`. A [`PathResolver`] maps each
//! prefix to a concrete root directory. Roots are passed in explicitly so
//! tests and embedders never depend on process-wide state.

use std::path::{Path, PathBuf};

/// Installation directory prefix
pub const PROGRAM: &str = "program:";
/// User files prefix
pub const PREFERENCES: &str = "preference:";
/// Settings directory prefix
pub const SETTINGS: &str = "settings:";
/// User home prefix
pub const HOME: &str = "home:";
/// Scripts directory prefix
pub const SCRIPTS: &str = "scripts:";

/// Separator used inside portable paths on every platform
pub const SEPARATOR: char = '/';

const APP_DIR: &str = "locomux";

/// Resolves portable path prefixes against explicit root directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    program: PathBuf,
    preferences: PathBuf,
    settings: PathBuf,
    home: PathBuf,
    scripts: PathBuf,
}

impl PathResolver {
    /// Create a resolver with explicit roots
    pub fn new(
        program: impl Into<PathBuf>,
        preferences: impl Into<PathBuf>,
        settings: impl Into<PathBuf>,
        home: impl Into<PathBuf>,
        scripts: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            preferences: preferences.into(),
            settings: settings.into(),
            home: home.into(),
            scripts: scripts.into(),
        }
    }

    /// Build a resolver from the platform's standard locations
    ///
    /// Settings live in `$XDG_CONFIG_HOME/locomux` (falling back to
    /// `~/.config/locomux`), user files in `~/locomux`, and scripts under the
    /// program directory.
    pub fn from_env(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        let settings = std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .unwrap_or_else(|| home.join(".config"))
            .join(APP_DIR);

        Self {
            scripts: program.join("scripts"),
            preferences: home.join(APP_DIR),
            settings,
            home,
            program,
        }
    }

    fn roots(&self) -> [(&'static str, &Path); 5] {
        [
            (PROGRAM, self.program.as_path()),
            (PREFERENCES, self.preferences.as_path()),
            (SETTINGS, self.settings.as_path()),
            (HOME, self.home.as_path()),
            (SCRIPTS, self.scripts.as_path()),
        ]
    }

    /// Turn a portable path into a concrete one
    ///
    /// An absolute path after a prefix is returned unchanged. Paths without a
    /// known prefix are returned as given.
    pub fn resolve(&self, portable: &str) -> PathBuf {
        for (prefix, root) in self.roots() {
            if let Some(rest) = portable.strip_prefix(prefix) {
                let rest = PathBuf::from(rest);
                if rest.is_absolute() {
                    return rest;
                }
                return root.join(native_separators(&rest));
            }
        }
        PathBuf::from(portable)
    }

    /// Express `path` relative to the most specific matching root
    ///
    /// Paths under no root are returned with `/` separators.
    pub fn portable(&self, path: &Path) -> String {
        let best = self
            .roots()
            .into_iter()
            .filter_map(|(prefix, root)| {
                path.strip_prefix(root).ok().map(|rest| (prefix, root, rest))
            })
            .max_by_key(|(_, root, _)| root.components().count());

        match best {
            Some((prefix, _, rest)) => format!("{}{}", prefix, portable_separators(rest)),
            None => portable_separators(path),
        }
    }

    /// Whether `name` starts with a known prefix
    pub fn is_portable(name: &str) -> bool {
        [PROGRAM, PREFERENCES, SETTINGS, HOME, SCRIPTS]
            .iter()
            .any(|prefix| name.starts_with(prefix))
    }

    /// Root for the `preference:` prefix
    pub fn preferences_dir(&self) -> &Path {
        &self.preferences
    }

    /// Root for the `settings:` prefix
    pub fn settings_dir(&self) -> &Path {
        &self.settings
    }
}

fn native_separators(path: &Path) -> PathBuf {
    path.to_string_lossy()
        .split(SEPARATOR)
        .filter(|part| !part.is_empty())
        .collect()
}

fn portable_separators(path: &Path) -> String {
    path.to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, &SEPARATOR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PathResolver {
        PathResolver::new(
            "/opt/locomux",
            "/home/op/locomux",
            "/home/op/.config/locomux",
            "/home/op",
            "/opt/locomux/scripts",
        )
    }

    #[test]
    fn test_resolve_prefixes() {
        let r = resolver();
        assert_eq!(
            r.resolve("preference:connections/dccex.json"),
            PathBuf::from("/home/op/locomux/connections/dccex.json")
        );
        assert_eq!(
            r.resolve("settings:layout.json"),
            PathBuf::from("/home/op/.config/locomux/layout.json")
        );
        assert_eq!(
            r.resolve("scripts:startup.txt"),
            PathBuf::from("/opt/locomux/scripts/startup.txt")
        );
        assert_eq!(r.resolve("relative/file"), PathBuf::from("relative/file"));
    }

    #[test]
    fn test_absolute_after_prefix_is_unchanged() {
        let r = resolver();
        assert_eq!(r.resolve("home:/etc/locomux.json"), PathBuf::from("/etc/locomux.json"));
    }

    #[test]
    fn test_portable_picks_most_specific_root() {
        let r = resolver();
        // Under both home: and preference:, preference: is deeper
        assert_eq!(
            r.portable(Path::new("/home/op/locomux/a/b.json")),
            "preference:a/b.json"
        );
        assert_eq!(r.portable(Path::new("/home/op/notes.txt")), "home:notes.txt");
        assert_eq!(
            r.portable(Path::new("/opt/locomux/scripts/x")),
            "scripts:x"
        );
        assert_eq!(r.portable(Path::new("/var/tmp/x")), "/var/tmp/x");
    }

    #[test]
    fn test_portable_round_trips_through_resolve() {
        let r = resolver();
        let path = PathBuf::from("/home/op/.config/locomux/conn/loconet.json");
        assert_eq!(r.resolve(&r.portable(&path)), path);
    }

    #[test]
    fn test_is_portable() {
        assert!(PathResolver::is_portable("program:lib"));
        assert!(PathResolver::is_portable("settings:"));
        assert!(!PathResolver::is_portable("/tmp/file"));
        assert!(!PathResolver::is_portable("profile:x"));
    }
}
