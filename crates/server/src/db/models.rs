use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use shared::{MemberInfo, Role, UserInfo, UserRole};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: String,
    /// Stable id issued by the identity provider
    pub external_id: String,
    pub email: String,
    pub name: String,
    pub avatar: Option<String>,
    pub role: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl User {
    pub fn uuid(&self) -> Result<Uuid> {
        Ok(Uuid::parse_str(&self.id)?)
    }

    /// Name shown next to chat messages
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.email
        } else {
            &self.name
        }
    }

    pub fn to_info(&self) -> Result<UserInfo> {
        Ok(UserInfo {
            id: self.uuid()?,
            email: self.email.clone(),
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            role: self.role.parse().unwrap_or(UserRole::User),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Workspace {
    pub fn uuid(&self) -> Result<Uuid> {
        Ok(Uuid::parse_str(&self.id)?)
    }

    pub fn owner_uuid(&self) -> Result<Uuid> {
        Ok(Uuid::parse_str(&self.owner_id)?)
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        self.created_at.as_deref().and_then(parse_sqlite_timestamp)
    }
}

/// Membership joined with the member's profile
#[derive(Debug, Clone, FromRow)]
pub struct MemberRow {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub role: String,
}

impl MemberRow {
    pub fn to_info(&self) -> Result<MemberInfo> {
        Ok(MemberInfo {
            user_id: Uuid::parse_str(&self.user_id)?,
            email: self.email.clone(),
            name: self.name.clone(),
            role: self.role.parse::<Role>()?,
        })
    }
}

/// `CURRENT_TIMESTAMP` yields `YYYY-MM-DD HH:MM:SS` in UTC
fn parse_sqlite_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_falls_back_to_email() {
        let user = User {
            id: Uuid::new_v4().to_string(),
            external_id: "g-1".to_string(),
            email: "ada@example.com".to_string(),
            name: "  ".to_string(),
            avatar: None,
            role: "user".to_string(),
            created_at: None,
            updated_at: None,
        };
        assert_eq!(user.display_name(), "ada@example.com");
    }

    #[test]
    fn test_parse_sqlite_timestamp() {
        let ts = parse_sqlite_timestamp("2026-03-01 12:30:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-01T12:30:00+00:00");
        assert!(parse_sqlite_timestamp("yesterday").is_none());
    }
}
