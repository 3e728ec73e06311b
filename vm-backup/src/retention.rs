//! Retention policy.

/// Entries to delete before writing a new backup, given a chronologically
/// sorted list of existing ones and the number of backups to keep.
///
/// One slot is reserved for the backup about to be written, so the newest
/// `retention - 1` entries survive. A retention of 0 disables deletion.
///
/// ```
/// use vm_backup::retention::select_stale;
///
/// let entries = ["a", "b", "c", "d", "e"];
/// assert_eq!(select_stale(&entries, 3), &["a", "b", "c"]);
/// assert!(select_stale(&entries, 0).is_empty());
/// ```
pub fn select_stale<T>(entries: &[T], retention: u32) -> &[T] {
    if retention == 0 {
        return &[];
    }
    let keep = retention as usize - 1;
    &entries[..entries.len().saturating_sub(keep)]
}
