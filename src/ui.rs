use colored::Colorize;
use declarative::{ResourceChange, Severity, Violation};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Print a checker finding
pub fn violation(violation: &Violation) {
    let line = format!(
        "{} {}: {}",
        violation.rule.code(),
        violation.resource,
        violation.message
    );
    match violation.severity {
        Severity::Error => eprintln!("  {} {}", "✗".red(), line),
        Severity::Warning => println!("  {} {}", "⚠".yellow(), line),
    }
}

/// Short label for a reconciliation outcome
pub fn change_label(change: &ResourceChange) -> String {
    match change {
        ResourceChange::NoChange => "unchanged".to_string(),
        ResourceChange::Created => "created".to_string(),
        ResourceChange::Modified => "updated".to_string(),
        ResourceChange::Replaced { retired } => format!("replaced (was {retired})"),
        ResourceChange::Removed => "deleted".to_string(),
        ResourceChange::Failed { error } => format!("failed: {error}"),
        ResourceChange::Skipped { reason } => format!("skipped: {reason}"),
    }
}

/// Print one resource outcome line
pub fn change(id: &str, change: &ResourceChange) {
    let label = change_label(change);
    match change {
        ResourceChange::NoChange => println!("  {} {} {}", "·".dimmed(), id, label.dimmed()),
        ResourceChange::Created | ResourceChange::Modified | ResourceChange::Replaced { .. } => {
            println!("  {} {} {}", "✓".green(), id, label.dimmed());
        }
        ResourceChange::Removed => println!("  {} {} {}", "−".red(), id, label.dimmed()),
        ResourceChange::Failed { .. } => eprintln!("  {} {} {}", "✗".red(), id, label.red()),
        ResourceChange::Skipped { .. } => println!("  {} {} {}", "⚠".yellow(), id, label.yellow()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::ProvisionError;

    #[test]
    fn test_change_labels() {
        assert_eq!(change_label(&ResourceChange::Created), "created");
        assert_eq!(change_label(&ResourceChange::NoChange), "unchanged");
        assert_eq!(
            change_label(&ResourceChange::Replaced {
                retired: "tg-1".to_string()
            }),
            "replaced (was tg-1)"
        );
        assert!(
            change_label(&ResourceChange::Failed {
                error: ProvisionError::permanent("quota exceeded"),
            })
            .contains("quota exceeded")
        );
    }
}
