//! src/services/metadata_store.rs
//!
//! Transactional records for documents, folders and quota counters.
//! `SqliteMetadataStore` is the shipped implementation; every write is a
//! single statement or a short transaction so callers can treat each method
//! as atomic.

use crate::{
    errors::{ServiceError, ServiceResult},
    models::{
        UserId,
        document::{Document, DocumentPage, DocumentQuery, DocumentUpdate, NewDocument},
        folder::Folder,
        quota::QuotaRecord,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::sync::Arc;

const DOCUMENT_COLUMNS: &str = "id, owner_id, folder_id, filename, original_filename, file_type, \
     location, size_bytes, checksum, created_at, updated_at";

const FOLDER_COLUMNS: &str = "id, owner_id, parent_id, name, created_at";

/// Quota transactions read and then write, so they take the write lock up front.
const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

/// Read-modify-write callback applied to one quota record inside a transaction.
pub type QuotaUpdate = Box<dyn FnOnce(&mut QuotaRecord) + Send>;

/// Narrow contract over the metadata store.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_document(&self, doc: NewDocument) -> ServiceResult<Document>;

    /// Delete a document owned by `owner_id`, returning the removed row or
    /// `None` when it does not exist for that owner.
    async fn delete_document(&self, id: i64, owner_id: UserId) -> ServiceResult<Option<Document>>;

    async fn get_document(&self, id: i64, owner_id: UserId) -> ServiceResult<Option<Document>>;

    /// One page of the owner's documents matching `query`, newest first.
    async fn list_documents(
        &self,
        owner_id: UserId,
        query: &DocumentQuery,
    ) -> ServiceResult<DocumentPage>;

    /// Apply a rename and/or move. `None` when the document does not exist
    /// for that owner. Folder ownership is checked by the caller.
    async fn update_document(
        &self,
        id: i64,
        owner_id: UserId,
        update: &DocumentUpdate,
    ) -> ServiceResult<Option<Document>>;

    async fn create_folder(
        &self,
        owner_id: UserId,
        name: &str,
        parent_id: Option<i64>,
    ) -> ServiceResult<Folder>;

    async fn folder_exists(&self, id: i64, owner_id: UserId) -> ServiceResult<bool>;

    async fn get_folder(&self, id: i64, owner_id: UserId) -> ServiceResult<Option<Folder>>;

    /// Direct children of `parent_id`, or the root folders when `None`.
    async fn list_folders(
        &self,
        owner_id: UserId,
        parent_id: Option<i64>,
    ) -> ServiceResult<Vec<Folder>>;

    async fn rename_folder(
        &self,
        id: i64,
        owner_id: UserId,
        name: &str,
    ) -> ServiceResult<Option<Folder>>;

    /// Delete an empty folder. `None` when it does not exist for that owner;
    /// `FolderNotEmpty` while it still holds documents or subfolders.
    async fn delete_folder(&self, id: i64, owner_id: UserId) -> ServiceResult<Option<Folder>>;

    /// Load the quota record for `user_id`, creating it with `default_total`
    /// and usage seeded from existing documents when absent.
    async fn load_quota(&self, user_id: UserId, default_total: u64) -> ServiceResult<QuotaRecord>;

    /// Atomically read, modify and write the quota record for `user_id`.
    async fn update_quota(
        &self,
        user_id: UserId,
        default_total: u64,
        update: QuotaUpdate,
    ) -> ServiceResult<QuotaRecord>;
}

/// SQLite-backed metadata store.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn create_document(&self, doc: NewDocument) -> ServiceResult<Document> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO documents (
                owner_id, folder_id, filename, original_filename, file_type,
                location, size_bytes, checksum, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {}",
            DOCUMENT_COLUMNS
        );
        sqlx::query_as::<_, Document>(&sql)
            .bind(doc.owner_id)
            .bind(doc.folder_id)
            .bind(&doc.filename)
            .bind(&doc.original_filename)
            .bind(&doc.file_type)
            .bind(&doc.location)
            .bind(doc.size_bytes)
            .bind(&doc.checksum)
            .bind(now)
            .bind(now)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    ServiceError::Conflict(format!("document `{}`", doc.filename))
                } else {
                    ServiceError::Sqlx(err)
                }
            })
    }

    async fn delete_document(&self, id: i64, owner_id: UserId) -> ServiceResult<Option<Document>> {
        let sql = format!(
            "DELETE FROM documents WHERE id = ? AND owner_id = ? RETURNING {}",
            DOCUMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, Document>(&sql)
            .bind(id)
            .bind(owner_id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row)
    }

    async fn get_document(&self, id: i64, owner_id: UserId) -> ServiceResult<Option<Document>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE id = ? AND owner_id = ?",
            DOCUMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, Document>(&sql)
            .bind(id)
            .bind(owner_id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row)
    }

    async fn list_documents(
        &self,
        owner_id: UserId,
        query: &DocumentQuery,
    ) -> ServiceResult<DocumentPage> {
        let size = query.page_size();
        let offset = i64::from(query.page) * i64::from(size);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(1) FROM documents");
        push_document_filters(&mut count, owner_id, query);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&*self.db).await?;

        let mut select =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM documents", DOCUMENT_COLUMNS));
        push_document_filters(&mut select, owner_id, query);
        select.push(" ORDER BY created_at DESC, id DESC LIMIT ");
        select.push_bind(i64::from(size));
        select.push(" OFFSET ");
        select.push_bind(offset);
        let items = select.build_query_as::<Document>().fetch_all(&*self.db).await?;

        Ok(DocumentPage {
            items,
            total,
            page: query.page,
            size,
        })
    }

    async fn update_document(
        &self,
        id: i64,
        owner_id: UserId,
        update: &DocumentUpdate,
    ) -> ServiceResult<Option<Document>> {
        let sql = format!(
            "UPDATE documents
             SET original_filename = COALESCE(?, original_filename),
                 folder_id = COALESCE(?, folder_id),
                 updated_at = ?
             WHERE id = ? AND owner_id = ?
             RETURNING {}",
            DOCUMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, Document>(&sql)
            .bind(update.filename.as_deref())
            .bind(update.folder_id)
            .bind(Utc::now())
            .bind(id)
            .bind(owner_id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row)
    }

    async fn create_folder(
        &self,
        owner_id: UserId,
        name: &str,
        parent_id: Option<i64>,
    ) -> ServiceResult<Folder> {
        if let Some(parent) = parent_id {
            if !self.folder_exists(parent, owner_id).await? {
                return Err(ServiceError::NotFound(format!("folder {}", parent)));
            }
        }

        let sql = format!(
            "INSERT INTO folders (owner_id, parent_id, name, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING {}",
            FOLDER_COLUMNS
        );
        sqlx::query_as::<_, Folder>(&sql)
            .bind(owner_id)
            .bind(parent_id)
            .bind(name)
            .bind(Utc::now())
            .fetch_one(&*self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    ServiceError::Conflict(format!("folder `{}`", name))
                } else {
                    ServiceError::Sqlx(err)
                }
            })
    }

    async fn folder_exists(&self, id: i64, owner_id: UserId) -> ServiceResult<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(1) FROM folders WHERE id = ? AND owner_id = ?",
        )
        .bind(id)
        .bind(owner_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(found > 0)
    }

    async fn get_folder(&self, id: i64, owner_id: UserId) -> ServiceResult<Option<Folder>> {
        let sql = format!(
            "SELECT {} FROM folders WHERE id = ? AND owner_id = ?",
            FOLDER_COLUMNS
        );
        let row = sqlx::query_as::<_, Folder>(&sql)
            .bind(id)
            .bind(owner_id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row)
    }

    async fn list_folders(
        &self,
        owner_id: UserId,
        parent_id: Option<i64>,
    ) -> ServiceResult<Vec<Folder>> {
        let sql = format!(
            "SELECT {} FROM folders
             WHERE owner_id = ? AND parent_id IS ?
             ORDER BY name ASC",
            FOLDER_COLUMNS
        );
        let rows = sqlx::query_as::<_, Folder>(&sql)
            .bind(owner_id)
            .bind(parent_id)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    async fn rename_folder(
        &self,
        id: i64,
        owner_id: UserId,
        name: &str,
    ) -> ServiceResult<Option<Folder>> {
        let sql = format!(
            "UPDATE folders SET name = ? WHERE id = ? AND owner_id = ? RETURNING {}",
            FOLDER_COLUMNS
        );
        sqlx::query_as::<_, Folder>(&sql)
            .bind(name)
            .bind(id)
            .bind(owner_id)
            .fetch_optional(&*self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    ServiceError::Conflict(format!("folder `{}`", name))
                } else {
                    ServiceError::Sqlx(err)
                }
            })
    }

    async fn delete_folder(&self, id: i64, owner_id: UserId) -> ServiceResult<Option<Folder>> {
        let mut tx = self.db.begin_with(BEGIN_WRITE).await?;
        let sql = format!(
            "SELECT {} FROM folders WHERE id = ? AND owner_id = ?",
            FOLDER_COLUMNS
        );
        let Some(folder) = sqlx::query_as::<_, Folder>(&sql)
            .bind(id)
            .bind(owner_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        let documents: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM documents WHERE folder_id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let folders: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM folders WHERE parent_id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        if documents > 0 || folders > 0 {
            return Err(ServiceError::FolderNotEmpty {
                folder_id: id,
                documents,
                folders,
            });
        }

        sqlx::query("DELETE FROM folders WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(folder))
    }

    async fn load_quota(&self, user_id: UserId, default_total: u64) -> ServiceResult<QuotaRecord> {
        let mut tx = self.db.begin_with(BEGIN_WRITE).await?;
        let record = fetch_or_create_quota(&mut tx, user_id, default_total).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn update_quota(
        &self,
        user_id: UserId,
        default_total: u64,
        update: QuotaUpdate,
    ) -> ServiceResult<QuotaRecord> {
        let mut tx = self.db.begin_with(BEGIN_WRITE).await?;
        let mut record = fetch_or_create_quota(&mut tx, user_id, default_total).await?;
        update(&mut record);
        record.used_bytes = record.used_bytes.max(0);
        record.updated_at = Utc::now();

        sqlx::query(
            "UPDATE quota_accounts
             SET used_bytes = ?, total_quota_bytes = ?, updated_at = ?
             WHERE user_id = ?",
        )
        .bind(record.used_bytes)
        .bind(record.total_quota_bytes)
        .bind(record.updated_at)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(record)
    }
}

/// Return the user's quota row, inserting one seeded from existing documents
/// when this is the first time the account is touched.
async fn fetch_or_create_quota(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: UserId,
    default_total: u64,
) -> ServiceResult<QuotaRecord> {
    let existing = sqlx::query_as::<_, QuotaRecord>(
        "SELECT user_id, used_bytes, total_quota_bytes, updated_at
         FROM quota_accounts WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(record) = existing {
        return Ok(record);
    }

    let used: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(size_bytes), 0) FROM documents WHERE owner_id = ?",
    )
    .bind(user_id)
    .fetch_one(&mut **tx)
    .await?;
    let total = i64::try_from(default_total).unwrap_or(i64::MAX);

    let record = sqlx::query_as::<_, QuotaRecord>(
        "INSERT INTO quota_accounts (user_id, used_bytes, total_quota_bytes, updated_at)
         VALUES (?, ?, ?, ?)
         RETURNING user_id, used_bytes, total_quota_bytes, updated_at",
    )
    .bind(user_id)
    .bind(used)
    .bind(total)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(record)
}

/// `WHERE` clause shared by the count and page queries of a listing.
fn push_document_filters(builder: &mut QueryBuilder<'_, Sqlite>, owner_id: UserId, query: &DocumentQuery) {
    builder.push(" WHERE owner_id = ");
    builder.push_bind(owner_id);
    if let Some(folder_id) = query.folder_id {
        builder.push(" AND folder_id = ");
        builder.push_bind(folder_id);
    }
    if let Some(file_type) = non_blank(query.file_type.as_deref()) {
        builder.push(" AND file_type = ");
        builder.push_bind(file_type.to_ascii_lowercase());
    }
    if let Some(keyword) = non_blank(query.keyword.as_deref()) {
        builder.push(" AND instr(lower(original_filename), ");
        builder.push_bind(keyword.to_lowercase());
        builder.push(") > 0");
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn store() -> SqliteMetadataStore {
        SqliteMetadataStore::new(Arc::new(db::memory_pool().await.unwrap()))
    }

    fn new_doc(owner_id: UserId, filename: &str, size: i64) -> NewDocument {
        NewDocument {
            owner_id,
            folder_id: None,
            filename: filename.to_string(),
            original_filename: filename.to_string(),
            file_type: "txt".into(),
            location: format!("aa/bb/{}", filename),
            size_bytes: size,
            checksum: "d41d8cd98f00b204e9800998ecf8427e".into(),
        }
    }

    #[tokio::test]
    async fn delete_is_scoped_to_owner() {
        let store = store().await;
        let doc = store.create_document(new_doc(1, "a.txt", 10)).await.unwrap();

        assert!(store.delete_document(doc.id, 2).await.unwrap().is_none());
        let removed = store.delete_document(doc.id, 1).await.unwrap().unwrap();
        assert_eq!(removed.size_bytes, 10);
        assert!(store.delete_document(doc.id, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn quota_row_is_seeded_from_existing_documents() {
        let store = store().await;
        store.create_document(new_doc(7, "a.txt", 120)).await.unwrap();
        store.create_document(new_doc(7, "b.txt", 30)).await.unwrap();

        let record = store.load_quota(7, 1000).await.unwrap();
        assert_eq!(record.used_bytes, 150);
        assert_eq!(record.total_quota_bytes, 1000);

        let updated = store
            .update_quota(7, 1000, Box::new(|r: &mut QuotaRecord| r.used_bytes -= 500))
            .await
            .unwrap();
        assert_eq!(updated.used_bytes, 0);
    }

    #[tokio::test]
    async fn duplicate_folder_names_conflict_per_parent() {
        let store = store().await;
        let root = store.create_folder(1, "reports", None).await.unwrap();
        assert!(matches!(
            store.create_folder(1, "reports", None).await,
            Err(ServiceError::Conflict(_))
        ));
        // same name for another owner or under another parent is fine
        store.create_folder(2, "reports", None).await.unwrap();
        store.create_folder(1, "reports", Some(root.id)).await.unwrap();

        assert!(store.folder_exists(root.id, 1).await.unwrap());
        assert!(!store.folder_exists(root.id, 2).await.unwrap());
    }

    #[tokio::test]
    async fn folders_list_by_parent_and_rename_within_owner() {
        let store = store().await;
        let docs = store.create_folder(1, "docs", None).await.unwrap();
        store.create_folder(1, "archive", None).await.unwrap();
        let inner = store.create_folder(1, "2024", Some(docs.id)).await.unwrap();
        store.create_folder(2, "other", None).await.unwrap();

        let roots = store.list_folders(1, None).await.unwrap();
        let names: Vec<_> = roots.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["archive", "docs"]);
        assert_eq!(store.list_folders(1, Some(docs.id)).await.unwrap(), vec![inner.clone()]);

        assert!(store.rename_folder(docs.id, 2, "stolen").await.unwrap().is_none());
        assert!(matches!(
            store.rename_folder(docs.id, 1, "archive").await,
            Err(ServiceError::Conflict(_))
        ));
        let renamed = store.rename_folder(docs.id, 1, "papers").await.unwrap().unwrap();
        assert_eq!(renamed.name, "papers");
        assert_eq!(store.get_folder(docs.id, 1).await.unwrap().unwrap().name, "papers");
        assert!(store.get_folder(docs.id, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn only_empty_folders_can_be_deleted() {
        let store = store().await;
        let parent = store.create_folder(1, "parent", None).await.unwrap();
        let child = store.create_folder(1, "child", Some(parent.id)).await.unwrap();
        let mut doc = new_doc(1, "in-child.txt", 5);
        doc.folder_id = Some(child.id);
        let doc = store.create_document(doc).await.unwrap();

        assert!(matches!(
            store.delete_folder(parent.id, 1).await,
            Err(ServiceError::FolderNotEmpty { documents: 0, folders: 1, .. })
        ));
        assert!(matches!(
            store.delete_folder(child.id, 1).await,
            Err(ServiceError::FolderNotEmpty { documents: 1, folders: 0, .. })
        ));
        assert!(store.delete_folder(child.id, 2).await.unwrap().is_none());

        store.delete_document(doc.id, 1).await.unwrap();
        assert_eq!(store.delete_folder(child.id, 1).await.unwrap().unwrap().id, child.id);
        assert!(store.delete_folder(parent.id, 1).await.unwrap().is_some());
        assert!(store.list_folders(1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn document_listing_filters_and_pages() {
        let store = store().await;
        let folder = store.create_folder(3, "inbox", None).await.unwrap();
        for n in 0..5 {
            let mut doc = new_doc(3, &format!("Invoice-{}.txt", n), 10);
            if n % 2 == 0 {
                doc.folder_id = Some(folder.id);
            }
            store.create_document(doc).await.unwrap();
        }
        let mut pdf = new_doc(3, "summary.pdf", 10);
        pdf.file_type = "pdf".into();
        store.create_document(pdf).await.unwrap();
        store.create_document(new_doc(4, "invoice-x.txt", 10)).await.unwrap();

        let all = store.list_documents(3, &DocumentQuery::default()).await.unwrap();
        assert_eq!(all.total, 6);
        assert_eq!(all.size, 20);
        assert_eq!(all.items[0].original_filename, "summary.pdf");

        let in_folder = DocumentQuery {
            folder_id: Some(folder.id),
            ..DocumentQuery::default()
        };
        assert_eq!(store.list_documents(3, &in_folder).await.unwrap().total, 3);

        let by_type = DocumentQuery {
            file_type: Some("PDF".into()),
            ..DocumentQuery::default()
        };
        assert_eq!(store.list_documents(3, &by_type).await.unwrap().total, 1);

        let second_page = DocumentQuery {
            keyword: Some("invoice".into()),
            page: 1,
            size: 2,
            ..DocumentQuery::default()
        };
        let page = store.list_documents(3, &second_page).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert!(page.items.iter().all(|d| d.owner_id == 3));
    }

    #[tokio::test]
    async fn update_renames_and_moves_for_the_owner_only() {
        let store = store().await;
        let folder = store.create_folder(1, "moved", None).await.unwrap();
        let doc = store.create_document(new_doc(1, "draft.txt", 10)).await.unwrap();

        let rename = DocumentUpdate {
            filename: Some("final.txt".into()),
            folder_id: None,
        };
        assert!(store.update_document(doc.id, 2, &rename).await.unwrap().is_none());
        let renamed = store.update_document(doc.id, 1, &rename).await.unwrap().unwrap();
        assert_eq!(renamed.original_filename, "final.txt");
        assert_eq!(renamed.folder_id, None);
        assert_eq!(renamed.filename, doc.filename);

        let moved = store
            .update_document(
                doc.id,
                1,
                &DocumentUpdate {
                    filename: None,
                    folder_id: Some(folder.id),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.folder_id, Some(folder.id));
        assert_eq!(moved.original_filename, "final.txt");
    }
}
