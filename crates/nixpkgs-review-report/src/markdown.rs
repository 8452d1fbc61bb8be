//! Markdown rendering of bucket lists

use crate::classify::Bucket;
use nixpkgs_review_nix::Attr;

/// Emoji, message and noun used to render a bucket
pub fn bucket_label(bucket: Bucket) -> (&'static str, &'static str, &'static str) {
    match bucket {
        Bucket::Broken => (":fast_forward:", "marked as broken and skipped", "package"),
        Bucket::NonExistent => (
            ":fast_forward:",
            "present in ofBorgs evaluation, but not found in the checkout",
            "package",
        ),
        Bucket::Blacklisted => (":fast_forward:", "blacklisted", "package"),
        Bucket::Skipped => (":fast_forward:", "skipped due to time constraints", "package"),
        Bucket::TimedOut => (":hourglass:", "timed out", "package"),
        Bucket::Failed => (":x:", "failed to build", "package"),
        Bucket::Tests => (":white_check_mark:", "built", "test"),
        Bucket::Built => (":white_check_mark:", "built", "package"),
    }
}

/// Order in which buckets appear in the markdown report
pub const MARKDOWN_ORDER: [Bucket; 8] = [
    Bucket::Broken,
    Bucket::NonExistent,
    Bucket::Blacklisted,
    Bucket::Skipped,
    Bucket::TimedOut,
    Bucket::Failed,
    Bucket::Tests,
    Bucket::Built,
];

/// Render a collapsible list of `attrs`.
///
/// Returns an empty string for an empty list. With `show` set, at most that
/// many entries are listed, followed by an ellipsis entry if there are more.
pub fn html_pkgs_section(
    emoji: &str,
    attrs: &[Attr],
    msg: &str,
    what: &str,
    show: Option<usize>,
) -> String {
    if attrs.is_empty() {
        return String::new();
    }
    let plural = if attrs.len() > 1 { "s" } else { "" };

    let mut res = String::from("<details>\n");
    res.push_str(&format!(
        "  <summary>{emoji} {} {what}{plural} {msg}:</summary>\n  <ul>\n",
        attrs.len()
    ));
    for (i, attr) in attrs.iter().enumerate() {
        if matches!(show, Some(limit) if limit > 0 && i >= limit) {
            res.push_str("    <li>...</li>\n");
            break;
        }

        match &attr.log_url {
            Some(url) => res.push_str(&format!("    <li><a href=\"{url}\">{}</a>", attr.name)),
            None => res.push_str(&format!("    <li>{}", attr.name)),
        }
        if !attr.aliases.is_empty() {
            res.push_str(&format!(" ({})", attr.aliases.join(" ,")));
        }
        res.push_str("</li>\n");
    }
    res.push_str("  </ul>\n</details>\n");
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_section() {
        assert_eq!(html_pkgs_section(":x:", &[], "failed to build", "package", None), "");
    }

    #[test]
    fn test_single_entry_with_log_and_aliases() {
        let mut attr = Attr::new("hello", true, false);
        attr.log_url = Some("https://gist.github.com/1".to_string());
        attr.aliases = vec!["hello-wayland".to_string(), "hello-x11".to_string()];

        assert_eq!(
            html_pkgs_section(":x:", &[attr], "failed to build", "package", None),
            "<details>\n  <summary>:x: 1 package failed to build:</summary>\n  <ul>\n    \
             <li><a href=\"https://gist.github.com/1\">hello</a> (hello-wayland ,hello-x11)</li>\n  \
             </ul>\n</details>\n"
        );
    }

    #[test]
    fn test_plural_and_noun() {
        let attrs = vec![
            Attr::new("nixosTests.a", true, false),
            Attr::new("nixosTests.b", true, false),
        ];
        let (emoji, msg, what) = bucket_label(Bucket::Tests);
        let section = html_pkgs_section(emoji, &attrs, msg, what, None);
        assert!(section.contains("<summary>:white_check_mark: 2 tests built:</summary>"));
    }

    #[test]
    fn test_limit_of_exact_length_has_no_ellipsis() {
        let attrs: Vec<_> = (0..3).map(|i| Attr::new(format!("p{i}"), true, false)).collect();
        let section = html_pkgs_section(":x:", &attrs, "failed to build", "package", Some(3));
        assert_eq!(section.matches("<li>").count(), 3);
        assert!(!section.contains("<li>...</li>"));
    }
}
