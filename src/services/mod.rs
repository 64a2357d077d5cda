pub mod ai_client;
pub mod qa_admin;
pub mod retrieval;
pub mod roles;

pub use ai_client::{AiClient, Analyzer};
pub use qa_admin::QaService;
pub use retrieval::{build_article_chunks, extract_keywords, retrieve_top_chunks, ArticleChunk};
pub use roles::RoleService;
