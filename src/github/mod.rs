//! GitHub users: REST client, domain records and the cached repository.

pub mod api_types;
pub mod cache;
pub mod client;
pub mod repository;
pub mod types;

pub use cache::UsersQuery;
pub use repository::UsersRepository;
pub use types::{User, UserWithDetail};
