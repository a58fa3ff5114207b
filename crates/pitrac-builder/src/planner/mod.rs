use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::packages::PackageTable;

/// Orders `candidates` so every package follows the dependencies it shares
/// with the candidate set.
///
/// Passes walk the remaining packages in declaration order and move each one
/// whose dependencies are satisfied. A dependency is satisfied once it has been
/// ordered, or when it is a known package outside the candidate set (it is not
/// being rebuilt, so it is already present). A pass that moves nothing fails
/// with `CircularOrMissingDependency`, covering both cycles and dependency
/// names absent from the table.
pub fn schedule(table: &PackageTable, candidates: &BTreeSet<String>) -> Result<Vec<String>> {
    for name in candidates {
        if !table.contains(name) {
            return Err(Error::UnknownPackage(name.clone()));
        }
    }

    let mut remaining: Vec<&str> = table
        .names()
        .filter(|n| candidates.contains(*n))
        .collect();
    let mut ordered: Vec<String> = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let mut moved = false;
        let mut next_remaining = Vec::with_capacity(remaining.len());
        for name in remaining {
            let Some(pkg) = table.get(name) else {
                continue;
            };
            let ready = pkg.deps.iter().all(|dep| {
                ordered.iter().any(|o| o == dep)
                    || (table.contains(dep) && !candidates.contains(dep))
            });
            if ready {
                ordered.push(name.to_string());
                moved = true;
            } else {
                next_remaining.push(name);
            }
        }
        remaining = next_remaining;
        if !moved && !remaining.is_empty() {
            return Err(Error::CircularOrMissingDependency {
                remaining: remaining.iter().map(|s| s.to_string()).collect(),
            });
        }
    }
    Ok(ordered)
}

/// GraphViz rendering of the candidate subgraph.
pub fn to_dot(table: &PackageTable, candidates: &BTreeSet<String>) -> String {
    let mut out = String::from("digraph packages {\n  rankdir=LR;\n");
    for pkg in table.iter() {
        let style = if candidates.contains(&pkg.name) {
            "bold"
        } else {
            "dashed"
        };
        out.push_str(&format!("  \"{}\" [style={}];\n", pkg.name, style));
    }
    for pkg in table.iter() {
        for dep in &pkg.deps {
            out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep, pkg.name));
        }
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::{PackageSpec, VersionSpec};

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn pkg(name: &str, deps: &[&str]) -> PackageSpec {
        PackageSpec::new(name, VersionSpec::Date, &[], deps)
    }

    #[test]
    fn dependencies_come_first() {
        let table = PackageTable::builtin();
        let all = set(&["pitrac", "opencv", "lgpio", "msgpack", "activemq"]);
        let order = schedule(&table, &all).unwrap();
        assert_eq!(order, ["lgpio", "msgpack", "activemq", "opencv", "pitrac"]);
    }

    #[test]
    fn deps_outside_the_candidate_set_count_as_present() {
        let table = PackageTable::builtin();
        let order = schedule(&table, &set(&["pitrac", "opencv"])).unwrap();
        assert_eq!(order, ["opencv", "pitrac"]);
        let order = schedule(&table, &set(&["pitrac"])).unwrap();
        assert_eq!(order, ["pitrac"]);
    }

    #[test]
    fn tie_break_follows_declaration_order_not_name_order() {
        let table = PackageTable::new(vec![
            pkg("zeta", &[]),
            pkg("app", &["zeta", "beta"]),
            pkg("beta", &[]),
        ])
        .unwrap();
        let all = set(&["app", "beta", "zeta"]);
        let first = schedule(&table, &all).unwrap();
        assert_eq!(first, ["zeta", "beta", "app"]);
        for _ in 0..5 {
            assert_eq!(schedule(&table, &all).unwrap(), first);
        }
    }

    #[test]
    fn every_package_follows_its_dependencies() {
        let table = PackageTable::new(vec![
            pkg("d", &["c"]),
            pkg("c", &["b"]),
            pkg("b", &["a"]),
            pkg("a", &[]),
            pkg("e", &["a", "d"]),
        ])
        .unwrap();
        let order = schedule(&table, &set(&["a", "b", "c", "d", "e"])).unwrap();
        for (idx, name) in order.iter().enumerate() {
            for dep in &table.get(name).unwrap().deps {
                let dep_idx = order.iter().position(|n| n == dep).unwrap();
                assert!(dep_idx < idx, "{dep} must precede {name} in {order:?}");
            }
        }
    }

    #[test]
    fn cycles_are_rejected() {
        let table = PackageTable::new(vec![pkg("a", &["b"]), pkg("b", &["a"])]).unwrap();
        let err = schedule(&table, &set(&["a", "b"])).unwrap_err();
        match err {
            Error::CircularOrMissingDependency { remaining } => {
                assert_eq!(remaining, ["a", "b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_dependency_names_are_rejected() {
        let table = PackageTable::new(vec![pkg("a", &["ghost"])]).unwrap();
        let err = schedule(&table, &set(&["a"])).unwrap_err();
        assert!(matches!(err, Error::CircularOrMissingDependency { .. }));
    }

    #[test]
    fn unknown_candidates_are_rejected() {
        let err = schedule(&PackageTable::builtin(), &set(&["ffmpeg"])).unwrap_err();
        assert!(matches!(err, Error::UnknownPackage(ref n) if n == "ffmpeg"));
    }

    #[test]
    fn dot_marks_candidates() {
        let dot = to_dot(&PackageTable::builtin(), &set(&["opencv"]));
        assert!(dot.contains("\"opencv\" [style=bold];"));
        assert!(dot.contains("\"lgpio\" [style=dashed];"));
        assert!(dot.contains("\"opencv\" -> \"pitrac\";"));
    }
}
