//! Picks the GitHub credential a build acts with.

use pages_core::site::{Site, User};
use pages_core::source_control::SourceControl;
use pages_core::{Build, Error, Result};
use tracing::{debug, warn};

/// Find a token that can push to the build's repository.
///
/// The initiating user is the only candidate when they are a site member;
/// otherwise every site user is. Candidates without a token or a recorded
/// sign-in are skipped, and the rest are tried most recently signed in
/// first. A denied or failed permission check moves on to the next one.
pub async fn load_build_user_access_token(
    source_control: &dyn SourceControl,
    build: &Build,
    site: &Site,
) -> Result<String> {
    let mut candidates: Vec<&User> = match build.user_id.and_then(|id| site.member(id)) {
        Some(user) => vec![user],
        None => site.users.iter().collect(),
    };
    candidates.retain(|u| {
        u.signed_in_at.is_some() && u.github_access_token.as_deref().is_some_and(|t| !t.is_empty())
    });
    candidates.sort_by(|a, b| b.signed_in_at.cmp(&a.signed_in_at));

    for user in candidates {
        let Some(token) = user.github_access_token.as_deref() else {
            continue;
        };
        match source_control
            .check_push_permission(token, &site.owner, &site.repository)
            .await
        {
            Ok(true) => {
                debug!(build_id = %build.id, user_id = %user.id, "Using credential");
                return Ok(token.to_string());
            }
            Ok(false) => {
                debug!(build_id = %build.id, user_id = %user.id, "User cannot push, trying next");
            }
            Err(e) => {
                warn!(build_id = %build.id, user_id = %user.id, error = %e, "Permission check failed, trying next");
            }
        }
    }

    Err(Error::NoCredential(build.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSourceControl, make_build, make_site, make_user};
    use pages_core::{BuildState, UserId};

    #[tokio::test]
    async fn test_most_recent_sign_in_wins() {
        let site = make_site(
            1,
            vec![
                make_user(1, Some("old-token"), Some(60)),
                make_user(2, Some("new-token"), Some(5)),
                make_user(3, Some("mid-token"), Some(30)),
            ],
        );
        let build = make_build(42, 1, BuildState::Created);
        let github = FakeSourceControl::allowing(&["old-token", "new-token", "mid-token"]);

        let token = load_build_user_access_token(&github, &build, &site)
            .await
            .unwrap();

        assert_eq!(token, "new-token");
        assert_eq!(github.checked(), vec!["new-token"]);
    }

    #[tokio::test]
    async fn test_denied_and_failing_checks_fall_through() {
        let site = make_site(
            1,
            vec![
                make_user(1, Some("denied"), Some(1)),
                make_user(2, Some("broken"), Some(2)),
                make_user(3, Some("allowed"), Some(3)),
            ],
        );
        let build = make_build(42, 1, BuildState::Created);
        let github = FakeSourceControl::allowing(&["allowed"]).failing_for("broken");

        let token = load_build_user_access_token(&github, &build, &site)
            .await
            .unwrap();

        assert_eq!(token, "allowed");
        assert_eq!(github.checked(), vec!["denied", "broken", "allowed"]);
    }

    #[tokio::test]
    async fn test_unusable_users_are_skipped() {
        let site = make_site(
            1,
            vec![
                make_user(1, None, Some(1)),
                make_user(2, Some(""), Some(1)),
                make_user(3, Some("never-signed-in"), None),
                make_user(4, Some("usable"), Some(90)),
            ],
        );
        let build = make_build(42, 1, BuildState::Created);
        let github = FakeSourceControl::allowing(&["never-signed-in", "usable"]);

        let token = load_build_user_access_token(&github, &build, &site)
            .await
            .unwrap();

        assert_eq!(token, "usable");
        assert_eq!(github.checked(), vec!["usable"]);
    }

    #[tokio::test]
    async fn test_initiating_member_is_the_only_candidate() {
        let site = make_site(
            1,
            vec![
                make_user(1, Some("initiator"), Some(60)),
                make_user(2, Some("other"), Some(1)),
            ],
        );
        let mut build = make_build(42, 1, BuildState::Created);
        build.user_id = Some(UserId::new(1));
        let github = FakeSourceControl::allowing(&["other"]);

        let result = load_build_user_access_token(&github, &build, &site).await;

        assert!(matches!(result, Err(Error::NoCredential(id)) if id == build.id));
        assert_eq!(github.checked(), vec!["initiator"]);
    }

    #[tokio::test]
    async fn test_non_member_initiator_uses_all_users() {
        let site = make_site(1, vec![make_user(2, Some("member"), Some(1))]);
        let mut build = make_build(42, 1, BuildState::Created);
        build.user_id = Some(UserId::new(99));
        let github = FakeSourceControl::allowing(&["member"]);

        let token = load_build_user_access_token(&github, &build, &site)
            .await
            .unwrap();

        assert_eq!(token, "member");
    }

    #[tokio::test]
    async fn test_exhausted_candidates_name_the_build() {
        let site = make_site(1, vec![make_user(1, Some("denied"), Some(1))]);
        let build = make_build(42, 1, BuildState::Created);
        let github = FakeSourceControl::allowing(&[]);

        let err = load_build_user_access_token(&github, &build, &site)
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "no valid access token found for build 42"
        );
    }
}
