//! Filter engine
//!
//! Last stage before delivery. Stateless apart from the compiled hook
//! regexes; events come out in the order they went in.

use crate::ignore::IgnoreRules;
use regex::Regex;
use treewatch_core::{FilterHook, FilterSet, WatchError, WatchEvent};

/// Compiled regex hooks; an event passes only if every hook matches
#[derive(Debug, Clone, Default)]
pub struct FilterHooks {
    hooks: Vec<(Regex, bool)>,
}

impl FilterHooks {
    pub fn compile(hooks: &[FilterHook]) -> Result<Self, WatchError> {
        let hooks = hooks
            .iter()
            .map(|hook| {
                Regex::new(&hook.reg)
                    .map(|re| (re, hook.use_full_path))
                    .map_err(|e| {
                        WatchError::InvalidConfig(format!("invalid filter hook '{}': {}", hook.reg, e))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { hooks })
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn matches(&self, event: &WatchEvent) -> bool {
        if self.hooks.is_empty() {
            return true;
        }

        let full = event.path.to_string_lossy();
        let name = event.name();
        self.hooks.iter().all(|(re, use_full_path)| {
            if *use_full_path {
                re.is_match(&full)
            } else {
                re.is_match(&name)
            }
        })
    }
}

/// Drop events on ignored paths or with unrequested operations
///
/// For Rename and Move, the event survives if its destination is not
/// ignored; a file moved out of an ignored directory is visible.
pub fn apply(event: WatchEvent, filters: &FilterSet, ignore: &IgnoreRules) -> Option<WatchEvent> {
    if !filters.allows(event.op) {
        tracing::trace!("filtered {} on {}", event.op, event.path.display());
        return None;
    }

    if ignore.should_ignore(&event.path, event.is_dir) {
        tracing::trace!("ignored {} on {}", event.op, event.path.display());
        return None;
    }

    Some(event)
}

/// [`apply`] followed by the configured hooks
pub fn apply_with_hooks(
    event: WatchEvent,
    filters: &FilterSet,
    ignore: &IgnoreRules,
    hooks: &FilterHooks,
) -> Option<WatchEvent> {
    apply(event, filters, ignore).filter(|event| hooks.matches(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use treewatch_core::Op;

    fn rules() -> IgnoreRules {
        let mut rules = IgnoreRules::new("/tmp/a");
        rules.add_path(PathBuf::from("/tmp/a/b"));
        rules
    }

    #[test]
    fn test_filter_set_drops_unrequested_ops() {
        let filters = FilterSet::new([Op::Create, Op::Write]);
        let ignore = IgnoreRules::new("/tmp/a");

        for op in Op::ALL {
            let event = WatchEvent::new(op, "/tmp/a/x.txt");
            let kept = apply(event, &filters, &ignore).is_some();
            assert_eq!(kept, matches!(op, Op::Create | Op::Write), "{}", op);
        }
    }

    #[test]
    fn test_empty_filter_set_allows_everything() {
        let ignore = IgnoreRules::new("/tmp/a");
        for op in Op::ALL {
            assert!(apply(WatchEvent::new(op, "/tmp/a/x"), &FilterSet::all(), &ignore).is_some());
        }
    }

    #[test]
    fn test_ignored_subtree_dropped() {
        let filters = FilterSet::all();
        let ignore = rules();

        assert!(apply(WatchEvent::new(Op::Create, "/tmp/a/b/e.txt"), &filters, &ignore).is_none());
        assert!(apply(WatchEvent::new(Op::Remove, "/tmp/a/b"), &filters, &ignore).is_none());
        assert!(apply(WatchEvent::new(Op::Create, "/tmp/a/c/e.txt"), &filters, &ignore).is_some());
    }

    #[test]
    fn test_move_out_of_ignored_dir_is_visible() {
        let event = WatchEvent::new(Op::Move, "/tmp/a/c/e.txt").with_old_path("/tmp/a/b/e.txt");
        assert!(apply(event, &FilterSet::all(), &rules()).is_some());
    }

    #[test]
    fn test_hooks_on_name_and_full_path() {
        let hooks = FilterHooks::compile(&[FilterHook {
            reg: r"\.txt$".into(),
            use_full_path: false,
        }])
        .unwrap();
        let ignore = IgnoreRules::new("/tmp/a");
        let filters = FilterSet::all();

        let txt = WatchEvent::new(Op::Write, "/tmp/a/notes.txt");
        let bin = WatchEvent::new(Op::Write, "/tmp/a/notes.bin");
        assert!(apply_with_hooks(txt, &filters, &ignore, &hooks).is_some());
        assert!(apply_with_hooks(bin, &filters, &ignore, &hooks).is_none());

        // A name-only hook anchored at the start never sees the directory
        let anchored = FilterHooks::compile(&[FilterHook {
            reg: "^/tmp".into(),
            use_full_path: false,
        }])
        .unwrap();
        assert!(!anchored.matches(&WatchEvent::new(Op::Write, "/tmp/a/notes.txt")));

        let full = FilterHooks::compile(&[FilterHook {
            reg: "^/tmp/a/".into(),
            use_full_path: true,
        }])
        .unwrap();
        assert!(full.matches(&WatchEvent::new(Op::Write, "/tmp/a/notes.txt")));
    }

    #[test]
    fn test_bad_hook_rejected() {
        let result = FilterHooks::compile(&[FilterHook {
            reg: "(".into(),
            use_full_path: false,
        }]);
        assert!(matches!(result, Err(WatchError::InvalidConfig(_))));
    }
}
