mod address_list;
mod email_address;
mod owner_id;

pub use address_list::{merge_address_lists, parse_address_list};
pub use email_address::EmailAddress;
pub use owner_id::OwnerId;
