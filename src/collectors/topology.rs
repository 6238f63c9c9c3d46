use crate::platform::ProcessProbe;
use std::collections::{HashSet, VecDeque};

/// `root` followed by all of its descendants, breadth-first. Pid 0 has no
/// family. Every pid is visited once, so a cycle in reported parentage
/// cannot loop.
pub fn family(probe: &dyn ProcessProbe, root: u32) -> Vec<u32> {
    let mut expanded = HashSet::new();
    let mut emitted = HashSet::new();
    let mut out = Vec::new();
    collect_family(probe, root, &mut expanded, &mut emitted, &mut out);
    out
}

/// `expanded` holds pids whose children were already walked; `emitted`
/// holds pids already in `out`. A pid emitted only as someone's parent is
/// still walked when it later turns up as a root.
fn collect_family(
    probe: &dyn ProcessProbe,
    root: u32,
    expanded: &mut HashSet<u32>,
    emitted: &mut HashSet<u32>,
    out: &mut Vec<u32>,
) {
    if root == 0 || !expanded.insert(root) {
        return;
    }
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if emitted.insert(pid) {
            out.push(pid);
        }
        for child in probe.children(pid) {
            if child != 0 && expanded.insert(child) {
                queue.push_back(child);
            }
        }
    }
}

/// Every process matching any of `names`, each with its descendants and its
/// direct parent (launchers and proxies sometimes carry the traffic).
/// Deduplicated, in discovery order.
pub fn family_of_names(probe: &dyn ProcessProbe, names: &[String]) -> Vec<u32> {
    let mut expanded = HashSet::new();
    let mut emitted = HashSet::new();
    let mut out = Vec::new();
    for name in names {
        let name = name.trim().trim_matches(|c| c == '"' || c == '\'');
        if name.is_empty() {
            continue;
        }
        let Ok(pids) = probe.pids_by_name(name) else {
            continue;
        };
        for pid in pids {
            collect_family(probe, pid, &mut expanded, &mut emitted, &mut out);
            if let Some(parent) = probe.parent(pid) {
                if parent != 0 && emitted.insert(parent) {
                    out.push(parent);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProbe;

    #[test]
    fn family_walks_breadth_first() {
        let probe = FakeProbe::default();
        let root = probe.spawn("launcher", &[]);
        let a = probe.spawn_child(root, "a");
        let b = probe.spawn_child(root, "b");
        let grandchild = probe.spawn_child(a, "c");
        probe.spawn("unrelated", &[]);

        assert_eq!(family(&probe, root), vec![root, a, b, grandchild]);
        assert!(family(&probe, 0).is_empty());
    }

    #[test]
    fn family_survives_parent_cycles() {
        let probe = FakeProbe::default();
        let a = probe.spawn("a", &[]);
        let b = probe.spawn_child(a, "b");
        probe.reparent(a, b);

        assert_eq!(family(&probe, a), vec![a, b]);
    }

    #[test]
    fn names_include_parent_and_dedupe() {
        let probe = FakeProbe::default();
        let launcher = probe.spawn("launcher", &[]);
        let game = probe.spawn_child(launcher, "game");
        let helper = probe.spawn_child(game, "helper");

        let names = vec![
            "\"game\"".to_string(),
            "helper".to_string(),
            " ".to_string(),
            "missing".to_string(),
        ];
        assert_eq!(family_of_names(&probe, &names), vec![game, helper, launcher]);
    }

    #[test]
    fn parent_listed_later_still_contributes_its_children() {
        let probe = FakeProbe::default();
        let launcher = probe.spawn("launcher", &[]);
        let game = probe.spawn_child(launcher, "game");
        let helper = probe.spawn_child(launcher, "helper");

        let names = vec!["game".to_string(), "launcher".to_string()];
        assert_eq!(family_of_names(&probe, &names), vec![game, launcher, helper]);
    }
}
