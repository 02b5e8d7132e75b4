//! Windows path decomposition into directory/file trees

use crate::mappers::Mapped;
use serde_json::{json, Value};
use smallvec::SmallVec;
use std::collections::HashSet;
use stixgraph_core::identity::IdentityMode;
use stixgraph_core::model::{attributes, Entity, StixId, TypeTag};

/// Contributing fields of a `directory`
pub const DIRECTORY_ID_FIELDS: &[&str] = &["path"];
/// Contributing fields of a `file`
pub const FILE_ID_FIELDS: &[&str] = &["hashes", "name", "extensions", "parent_directory_ref"];

/// One path component; the anchor is the drive, share or root prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component<'a> {
    Anchor(String),
    Name(&'a str),
}

impl Component<'_> {
    fn as_str(&self) -> &str {
        match self {
            Component::Anchor(anchor) => anchor,
            Component::Name(name) => name,
        }
    }
}

pub type Components<'a> = SmallVec<[Component<'a>; 8]>;

/// Split a Windows path. Strings without a backslash are not paths.
pub fn split_windows_path(raw: &str) -> Option<Components<'_>> {
    if !raw.contains('\\') {
        return None;
    }

    let mut components = Components::new();
    let names: Vec<&str>;

    if let Some(rest) = raw.strip_prefix("\\\\") {
        // \\server\share\...
        let mut parts = rest.split(['\\', '/']).filter(|p| !p.is_empty());
        let server = parts.next()?;
        let anchor = match parts.next() {
            Some(share) => format!("\\\\{}\\{}\\", server, share),
            None => format!("\\\\{}\\", server),
        };
        components.push(Component::Anchor(anchor));
        names = parts.collect();
    } else {
        let mut parts = raw.split(['\\', '/']);
        match parts.next() {
            Some("") => components.push(Component::Anchor("\\".to_string())),
            Some(first) if first.len() == 2 && first.ends_with(':') => {
                components.push(Component::Anchor(format!("{}\\", first)))
            }
            Some(first) => components.push(Component::Name(first)),
            None => return None,
        }
        names = parts.collect();
    }

    components.extend(
        names
            .into_iter()
            .filter(|name| !name.is_empty() && *name != ".")
            .map(Component::Name),
    );

    if components.is_empty() {
        None
    } else {
        Some(components)
    }
}

/// Join the first `len` components back into a path string
fn joined_prefix(components: &[Component<'_>], len: usize) -> String {
    let mut path = String::new();
    for component in &components[..len] {
        if matches!(component, Component::Name(_)) && !path.is_empty() && !path.ends_with('\\') {
            path.push('\\');
        }
        path.push_str(component.as_str());
    }
    path
}

/// Result of building a tree over a batch of paths
#[derive(Debug, Clone, Default)]
pub struct PathTree {
    /// Every directory and file, first-creation order
    pub entities: Vec<Entity>,
    /// Top-level entities only
    pub roots: Vec<Entity>,
}

impl PathTree {
    /// With `link_all` every node is peripheral; otherwise only the roots are
    pub fn into_mapped(self, link_all: bool) -> Mapped {
        let mut mapped = Mapped::new();
        if link_all {
            for entity in self.entities {
                mapped.link(entity);
            }
        } else {
            for root in self.roots {
                mapped.link(root);
            }
            for entity in self.entities {
                mapped.include(entity);
            }
        }
        mapped
    }
}

/// Memoizing builder; shared prefixes collapse onto one directory
#[derive(Debug, Default)]
pub struct PathTreeBuilder {
    entities: Vec<Entity>,
    seen: HashSet<StixId>,
    root_ids: Vec<StixId>,
}

impl PathTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one path, returning the id of its terminal entity
    pub fn add_path(&mut self, raw: &str) -> Option<StixId> {
        let components = split_windows_path(raw)?;
        let mut parent: Option<StixId> = None;

        for (index, component) in components.iter().enumerate() {
            let terminal = index + 1 == components.len();
            let entity = match component {
                Component::Name(name) if terminal => file_entity(name, parent.as_ref()),
                _ => directory_entity(&joined_prefix(&components, index + 1)),
            }?;

            let id = entity.id().clone();
            if index == 0 && !self.root_ids.contains(&id) {
                self.root_ids.push(id.clone());
            }
            if self.seen.insert(id.clone()) {
                self.entities.push(entity);
            }
            parent = Some(id);
        }

        parent
    }

    pub fn extend<'a, I>(&mut self, paths: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for path in paths {
            if self.add_path(path).is_none() {
                tracing::trace!(value = %path, "skipping non-path entry");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn build(self) -> PathTree {
        let roots = self
            .entities
            .iter()
            .filter(|entity| self.root_ids.contains(entity.id()))
            .cloned()
            .collect();
        PathTree {
            entities: self.entities,
            roots,
        }
    }
}

fn directory_entity(path: &str) -> Option<Entity> {
    Entity::new(
        TypeTag::Directory,
        IdentityMode::ContentDerived(DIRECTORY_ID_FIELDS),
        attributes([("path", json!(path))]),
    )
}

fn file_entity(name: &str, parent: Option<&StixId>) -> Option<Entity> {
    Entity::new(
        TypeTag::File,
        IdentityMode::ContentDerived(FILE_ID_FIELDS),
        attributes([
            ("name", json!(name)),
            (
                "parent_directory_ref",
                parent.map_or(Value::Null, |id| json!(id.to_string())),
            ),
        ]),
    )
}

/// Build the tree for `paths` in one call
pub fn build_tree<'a, I>(paths: I) -> PathTree
where
    I: IntoIterator<Item = &'a String>,
{
    let mut builder = PathTreeBuilder::new();
    builder.extend(paths);
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn of_type(tree: &PathTree, tag: TypeTag) -> Vec<&Entity> {
        tree.entities.iter().filter(|e| e.type_tag() == tag).collect()
    }

    #[test]
    fn test_split_drive_path() {
        let components = split_windows_path("C:\\a\\b\\c.exe").unwrap();
        assert_eq!(components[0], Component::Anchor("C:\\".into()));
        assert_eq!(components.len(), 4);
        assert_eq!(joined_prefix(&components, 1), "C:\\");
        assert_eq!(joined_prefix(&components, 2), "C:\\a");
        assert_eq!(joined_prefix(&components, 3), "C:\\a\\b");
    }

    #[test]
    fn test_split_unc_and_rooted() {
        let unc = split_windows_path("\\\\srv\\share\\x.txt").unwrap();
        assert_eq!(unc[0].as_str(), "\\\\srv\\share\\");
        assert_eq!(unc.len(), 2);

        let rooted = split_windows_path("\\Device\\HarddiskVolume2").unwrap();
        assert_eq!(rooted[0].as_str(), "\\");
        assert_eq!(joined_prefix(&rooted, 2), "\\Device");
    }

    #[test]
    fn test_non_paths_are_skipped() {
        assert!(split_windows_path("kernel32.dll").is_none());
        assert!(split_windows_path("").is_none());

        let tree = build_tree(&paths(&["not a path", "ntdll"]));
        assert!(tree.entities.is_empty());
        assert!(tree.roots.is_empty());
    }

    #[test]
    fn test_shared_prefix_collapses() {
        let tree = build_tree(&paths(&["C:\\a\\b\\c.exe", "C:\\a\\d.dll"]));

        let dirs = of_type(&tree, TypeTag::Directory);
        let a: Vec<_> = dirs
            .iter()
            .filter(|d| d.attribute("path") == Some(&json!("C:\\a")))
            .collect();
        assert_eq!(a.len(), 1);
        assert_eq!(dirs.len(), 3); // C:\, C:\a, C:\a\b

        let files = of_type(&tree, TypeTag::File);
        assert_eq!(files.len(), 2);
        let dll = files
            .iter()
            .find(|f| f.attribute("name") == Some(&json!("d.dll")))
            .unwrap();
        assert_eq!(
            dll.attribute("parent_directory_ref"),
            Some(&json!(a[0].id().to_string()))
        );

        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.roots[0].attribute("path"), Some(&json!("C:\\")));
    }

    #[test]
    fn test_same_name_in_different_directories() {
        let tree = build_tree(&paths(&["C:\\x\\run.exe", "C:\\y\\run.exe"]));
        assert_eq!(of_type(&tree, TypeTag::File).len(), 2);
    }

    #[test]
    fn test_repeated_path_is_memoized() {
        let mut builder = PathTreeBuilder::new();
        let first = builder.add_path("C:\\a\\b.txt");
        let second = builder.add_path("C:\\a\\b.txt");
        assert_eq!(first, second);
        assert_eq!(builder.len(), 3);
    }

    #[test]
    fn test_relative_path_single_root() {
        let tree = build_tree(&paths(&["temp\\x.bin"]));
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.roots[0].attribute("path"), Some(&json!("temp")));
    }

    #[test]
    fn test_link_modes() {
        let items = paths(&["C:\\a\\b.txt", "D:\\c.txt"]);

        let flat = build_tree(&items).into_mapped(true);
        assert_eq!(flat.peripheral.len(), 5);
        assert!(flat.objects.is_empty());

        let rooted = build_tree(&items).into_mapped(false);
        assert_eq!(rooted.peripheral.len(), 2);
        assert_eq!(rooted.objects.len(), 5);
    }
}
