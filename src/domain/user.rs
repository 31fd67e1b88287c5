use serde::{Deserialize, Serialize};

use crate::api::config_dto::UserDto;
use crate::domain::utils::id::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    User,
    Admin,
}

/// An authenticated caller of the booking service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub role: UserRole,
}

impl User {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>, role: UserRole) -> Self {
        Self { id: id.into(), name: name.into(), role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

impl From<UserDto> for User {
    fn from(dto: UserDto) -> Self {
        User { id: UserId::new(dto.id), name: dto.name, role: dto.role }
    }
}
