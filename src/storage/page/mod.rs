pub mod error;
pub mod header;
pub mod layout;
pub mod page;
pub mod table_page;

pub use error::PageError;
pub use header::TablePageHeader;
pub use page::Page;
pub use table_page::TablePage;
