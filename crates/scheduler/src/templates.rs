//! Email bodies rendered from in-app notifications.

use classrep_core::{NotificationJob, NotificationType};
use classrep_infra::EmailJob;

struct Template {
    label: &'static str,
    accent: &'static str,
}

fn template(kind: NotificationType) -> Template {
    match kind {
        NotificationType::Class => Template {
            label: "Class update",
            accent: "#2563eb",
        },
        NotificationType::Assessment => Template {
            label: "Assessment update",
            accent: "#7c3aed",
        },
        NotificationType::Notice => Template {
            label: "New notice",
            accent: "#0891b2",
        },
        NotificationType::Issue => Template {
            label: "Issue update",
            accent: "#dc2626",
        },
        NotificationType::System => Template {
            label: "Announcement",
            accent: "#4b5563",
        },
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Email for one recipient of `job`.
pub fn render_email(job: &NotificationJob, to: &str) -> EmailJob {
    let t = template(job.kind);
    let html = format!(
        concat!(
            "<div style=\"font-family:sans-serif;max-width:560px\">",
            "<p style=\"color:{accent};font-size:12px;text-transform:uppercase\">{label}</p>",
            "<h2>{title}</h2>",
            "<p>{message}</p>",
            "</div>"
        ),
        accent = t.accent,
        label = t.label,
        title = escape_html(&job.title),
        message = escape_html(&job.message),
    );
    EmailJob {
        to: to.to_string(),
        subject: format!("{}: {}", t.label, job.title),
        html,
    }
}

#[cfg(test)]
mod tests {
    use classrep_core::{Audience, UserId};

    use super::*;

    #[test]
    fn user_text_is_escaped() {
        let job = NotificationJob::new(
            NotificationType::Notice,
            "Room <B>",
            "Bring \"pens\" & paper",
            Audience::Users {
                user_ids: vec![UserId::new()],
            },
        );
        let email = render_email(&job, "s@uni.test");
        assert_eq!(email.subject, "New notice: Room <B>");
        assert!(email.html.contains("Room &lt;B&gt;"));
        assert!(email.html.contains("&quot;pens&quot; &amp; paper"));
    }
}
