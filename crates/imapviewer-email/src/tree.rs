use imapviewer_core::{MailboxEntry, MailboxNode, SpecialUse};
use std::cmp::Ordering;

/// Nests a flat LIST result by each entry's hierarchy delimiter.
///
/// Parents missing from the listing are synthesized as non-selectable nodes.
/// Inbox sorts first at the top level, everything else by name.
pub fn build_mailbox_tree(entries: &[MailboxEntry]) -> Vec<MailboxNode> {
    let mut sorted: Vec<&MailboxEntry> = entries.iter().collect();
    sorted.sort_by(|left, right| left.path.cmp(&right.path));

    let mut roots = Vec::new();
    for entry in sorted {
        let segments = segments(entry);
        insert(&mut roots, entry, &segments, 0);
    }
    sort_level(&mut roots);
    roots
}

fn segments(entry: &MailboxEntry) -> Vec<&str> {
    let parts: Vec<&str> = match entry.delimiter.as_deref() {
        Some(delimiter) if !delimiter.is_empty() => entry
            .path
            .split(delimiter)
            .filter(|part| !part.is_empty())
            .collect(),
        _ => Vec::new(),
    };
    if parts.is_empty() {
        vec![entry.path.as_str()]
    } else {
        parts
    }
}

fn insert(level: &mut Vec<MailboxNode>, entry: &MailboxEntry, segments: &[&str], depth: usize) {
    let name = segments[depth];
    let index = match level.iter().position(|node| node.name == name) {
        Some(index) => index,
        None => {
            let delimiter = entry.delimiter.clone();
            let path = segments[..=depth].join(delimiter.as_deref().unwrap_or(""));
            level.push(MailboxNode {
                name: name.to_string(),
                path,
                delimiter,
                special_use: None,
                flags: Vec::new(),
                selectable: false,
                children: Vec::new(),
            });
            level.len() - 1
        }
    };

    let node = &mut level[index];
    if depth + 1 == segments.len() {
        node.path = entry.path.clone();
        node.flags = entry.flags.clone();
        node.special_use = entry.special_use;
        node.selectable = entry.is_selectable();
    } else {
        insert(&mut node.children, entry, segments, depth + 1);
    }
}

fn sort_level(level: &mut [MailboxNode]) {
    level.sort_by(|left, right| {
        let left_inbox = left.special_use == Some(SpecialUse::Inbox);
        let right_inbox = right.special_use == Some(SpecialUse::Inbox);
        match (left_inbox, right_inbox) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => left
                .name
                .to_lowercase()
                .cmp(&right.name.to_lowercase()),
        }
    });
    for node in level.iter_mut() {
        sort_level(&mut node.children);
    }
}
