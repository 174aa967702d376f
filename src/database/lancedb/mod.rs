// LanceDB vector index
// One table per collection; vector dimension is detected from the first write


use arrow::array::{
    Array, BooleanArray, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray,
    UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::TryStreamExt;
use itertools::Itertools;
use lancedb::{
    Connection, DistanceType, Table,
    query::{ExecutableQuery, QueryBase},
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::database::vector::{
    ChunkKind, DocumentFilter, IndexedDocument, ScoredDocument, SearchQuery, VectorIndex,
    hybrid_fuse,
};
use crate::embeddings::sparse::SparseVector;
use crate::{Result, ReviewError};

/// Dense candidates fetched per requested hybrid result
const HYBRID_OVERSAMPLE: usize = 4;
/// Ids per `IN (...)` predicate when replacing documents
const DELETE_BATCH: usize = 500;

/// Vector index backed by an embedded LanceDB database
pub struct LanceVectorStore {
    connection: Connection,
    /// collection -> vector dimension of its table
    dimensions: Mutex<HashMap<String, usize>>,
}

impl LanceVectorStore {
    /// Open (or create) the database under `db_path`
    #[inline]
    pub async fn new(db_path: &Path) -> Result<Self> {
        debug!("Initializing LanceDB at path: {:?}", db_path);

        std::fs::create_dir_all(db_path).map_err(|e| {
            ReviewError::Database(format!("Failed to create vector database directory: {}", e))
        })?;

        let uri = format!("file://{}", db_path.display());
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| ReviewError::Database(format!("Failed to connect to LanceDB: {}", e)))?;

        info!("Vector store initialized successfully");
        Ok(Self {
            connection,
            dimensions: Mutex::new(HashMap::new()),
        })
    }

    async fn table_exists(&self, collection: &str) -> Result<bool> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| ReviewError::Database(format!("Failed to list tables: {}", e)))?;
        Ok(table_names.iter().any(|name| name == collection))
    }

    async fn open(&self, collection: &str) -> Result<Option<Table>> {
        if !self.table_exists(collection).await? {
            return Ok(None);
        }
        let table = self
            .connection
            .open_table(collection)
            .execute()
            .await
            .map_err(|e| ReviewError::Database(format!("Failed to open table: {}", e)))?;
        Ok(Some(table))
    }

    /// Detect vector dimension from existing table schema
    async fn existing_dimension(table: &Table) -> Result<Option<usize>> {
        let schema = table
            .schema()
            .await
            .map_err(|e| ReviewError::Database(format!("Failed to get table schema: {}", e)))?;

        Ok(schema.fields().iter().find_map(|field| {
            match (field.name().as_str(), field.data_type()) {
                ("vector", DataType::FixedSizeList(_, size)) => usize::try_from(*size).ok(),
                _ => None,
            }
        }))
    }

    /// Open the collection's table, creating or recreating it for `dimension`
    async fn table_for_write(&self, collection: &str, dimension: usize) -> Result<Table> {
        let cached = self
            .dimensions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .copied();

        if let Some(table) = self.open(collection).await? {
            let current = match cached {
                Some(dim) => Some(dim),
                None => Self::existing_dimension(&table).await?,
            };
            if current == Some(dimension) {
                self.remember_dimension(collection, dimension);
                return Ok(table);
            }

            warn!(
                "Vector dimension of {} changed from {:?} to {}, recreating table",
                collection, current, dimension
            );
            self.connection
                .drop_table(collection)
                .await
                .map_err(|e| ReviewError::Database(format!("Failed to drop table: {}", e)))?;
        }

        let table = self
            .connection
            .create_empty_table(collection, create_schema(dimension)?)
            .execute()
            .await
            .map_err(|e| ReviewError::Database(format!("Failed to create table: {}", e)))?;
        self.remember_dimension(collection, dimension);

        info!("Created table {} with {} dimensions", collection, dimension);
        Ok(table)
    }

    fn remember_dimension(&self, collection: &str, dimension: usize) {
        self.dimensions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(collection.to_string(), dimension);
    }

    /// Compact and reorganize a collection's table
    #[inline]
    pub async fn optimize(&self, collection: &str) -> Result<()> {
        let Some(table) = self.open(collection).await? else {
            return Ok(());
        };

        table
            .optimize(lancedb::table::OptimizeAction::All)
            .await
            .map_err(|e| ReviewError::Database(format!("Failed to optimize table: {}", e)))?;

        info!("Vector table {} optimized", collection);
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for LanceVectorStore {
    async fn add_documents(
        &self,
        collection: &str,
        documents: Vec<IndexedDocument>,
    ) -> Result<usize> {
        let Some(first) = documents.first() else {
            debug!("No documents to store");
            return Ok(0);
        };

        let dimension = first.vector.len();
        if dimension == 0 {
            return Err(ReviewError::Database(
                "Cannot store documents without embeddings".to_string(),
            ));
        }
        if let Some(bad) = documents.iter().find(|doc| doc.vector.len() != dimension) {
            return Err(ReviewError::Database(format!(
                "Inconsistent vector dimension for {}: expected {}, got {}",
                bad.source,
                dimension,
                bad.vector.len()
            )));
        }

        let table = self.table_for_write(collection, dimension).await?;

        // Replace semantics: remove any rows carrying the incoming ids first
        for ids in documents.chunks(DELETE_BATCH) {
            let predicate = format!(
                "id IN ({})",
                ids.iter().map(|doc| quote(&doc.id)).join(", ")
            );
            table.delete(&predicate).await.map_err(|e| {
                ReviewError::Database(format!("Failed to replace documents: {}", e))
            })?;
        }

        let record_batch = create_record_batch(&documents, dimension)?;
        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| ReviewError::Database(format!("Failed to insert documents: {}", e)))?;

        debug!("Stored {} documents in {}", documents.len(), collection);
        Ok(documents.len())
    }

    async fn similarity_search(
        &self,
        collection: &str,
        query: &SearchQuery,
    ) -> Result<Vec<ScoredDocument>> {
        let Some(table) = self.open(collection).await? else {
            return Ok(Vec::new());
        };

        let hybrid = query.sparse.as_ref().filter(|sparse| !sparse.is_empty());
        let limit = if hybrid.is_some() {
            query.k.saturating_mul(HYBRID_OVERSAMPLE)
        } else {
            query.k
        };

        let mut search = table
            .vector_search(query.vector.as_slice())
            .map_err(|e| ReviewError::Database(format!("Failed to create vector search: {}", e)))?
            .column("vector")
            .distance_type(DistanceType::Cosine)
            .limit(limit);

        if let Some(filter) = &query.filter {
            search = search.only_if(filter_to_sql(filter));
        }

        let stream = search
            .execute()
            .await
            .map_err(|e| ReviewError::Database(format!("Failed to execute search: {}", e)))?;

        let mut dense: Vec<ScoredDocument> = read_stream(stream)
            .await?
            .into_iter()
            .filter(|(doc, _)| query.filter.as_ref().is_none_or(|f| f.matches(doc)))
            .map(|(document, distance)| {
                // Convert distance to similarity score (higher is better)
                ScoredDocument::new(document, 1.0 - distance.unwrap_or(0.0))
            })
            .collect();

        match hybrid {
            Some(sparse) => Ok(hybrid_fuse(dense, sparse, query.k)),
            None => {
                dense.truncate(query.k);
                Ok(dense)
            }
        }
    }

    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        limit: usize,
    ) -> Result<Vec<IndexedDocument>> {
        let Some(table) = self.open(collection).await? else {
            return Ok(Vec::new());
        };

        let stream = table
            .query()
            .only_if(filter_to_sql(filter))
            .limit(limit)
            .execute()
            .await
            .map_err(|e| ReviewError::Database(format!("Failed to execute query: {}", e)))?;

        Ok(read_stream(stream)
            .await?
            .into_iter()
            .map(|(doc, _)| doc)
            .filter(|doc| filter.matches(doc))
            .collect())
    }

    async fn delete_by_filter(&self, collection: &str, filter: &DocumentFilter) -> Result<()> {
        let Some(table) = self.open(collection).await? else {
            return Ok(());
        };

        let predicate = filter_to_sql(filter);
        table
            .delete(&predicate)
            .await
            .map_err(|e| ReviewError::Database(format!("Failed to delete documents: {}", e)))?;

        debug!("Deleted documents from {} where {}", collection, predicate);
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        if self.table_exists(collection).await? {
            info!("Dropping collection {}", collection);
            self.connection
                .drop_table(collection)
                .await
                .map_err(|e| ReviewError::Database(format!("Failed to drop table: {}", e)))?;
        }
        self.dimensions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(collection);
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let Some(table) = self.open(collection).await? else {
            return Ok(0);
        };
        table
            .count_rows(None)
            .await
            .map_err(|e| ReviewError::Database(format!("Failed to count rows: {}", e)))
    }
}

/// Create schema with the specified vector dimension
fn create_schema(vector_dim: usize) -> Result<Arc<Schema>> {
    let list_size = i32::try_from(vector_dim)
        .map_err(|_| ReviewError::Database(format!("Vector dimension too large: {}", vector_dim)))?;

    Ok(Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                list_size,
            ),
            false,
        ),
        Field::new("content", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("chunk_kind", DataType::Utf8, false),
        Field::new("identifier", DataType::Utf8, true),
        Field::new("line_start", DataType::UInt32, false),
        Field::new("line_end", DataType::UInt32, false),
        Field::new("parent_id", DataType::Utf8, true),
        Field::new("full_parent_text", DataType::Utf8, true),
        Field::new("package_name", DataType::Utf8, true),
        Field::new("imports", DataType::Utf8, false),
        Field::new("is_test", DataType::Boolean, false),
        Field::new("content_hash", DataType::Utf8, true),
        Field::new("generated_at", DataType::Utf8, true),
        Field::new("file_count", DataType::UInt32, true),
        Field::new("sparse", DataType::Utf8, true),
    ])))
}

/// Imports are stored delimited on both ends so a LIKE can match whole entries
fn encode_imports(imports: &[String]) -> String {
    if imports.is_empty() {
        return String::new();
    }
    format!("|{}|", imports.join("|"))
}

fn decode_imports(encoded: &str) -> Vec<String> {
    encoded
        .split('|')
        .filter(|part| !part.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn create_record_batch(documents: &[IndexedDocument], dimension: usize) -> Result<RecordBatch> {
    let schema = create_schema(dimension)?;

    let mut flat_values = Vec::with_capacity(documents.len() * dimension);
    for doc in documents {
        flat_values.extend_from_slice(&doc.vector);
    }
    let field = Arc::new(Field::new("item", DataType::Float32, true));
    let list_size = i32::try_from(dimension)
        .map_err(|_| ReviewError::Database(format!("Vector dimension too large: {}", dimension)))?;
    let vector_array = FixedSizeListArray::try_new(
        field,
        list_size,
        Arc::new(Float32Array::from(flat_values)),
        None,
    )
    .map_err(|e| ReviewError::Database(format!("Failed to create vector array: {}", e)))?;

    let imports: Vec<String> = documents
        .iter()
        .map(|doc| encode_imports(&doc.imports))
        .collect();
    let sparse: Vec<Option<String>> = documents
        .iter()
        .map(|doc| {
            doc.sparse
                .as_ref()
                .and_then(|sparse| serde_json::to_string(sparse).ok())
        })
        .collect();

    let arrays: Vec<Arc<dyn Array>> = vec![
        Arc::new(StringArray::from_iter_values(documents.iter().map(|d| d.id.as_str()))),
        Arc::new(vector_array),
        Arc::new(StringArray::from_iter_values(documents.iter().map(|d| d.content.as_str()))),
        Arc::new(StringArray::from_iter_values(documents.iter().map(|d| d.source.as_str()))),
        Arc::new(StringArray::from_iter_values(
            documents.iter().map(|d| d.chunk_kind.as_str()),
        )),
        Arc::new(StringArray::from(
            documents.iter().map(|d| d.identifier.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from_iter_values(documents.iter().map(|d| d.line_start))),
        Arc::new(UInt32Array::from_iter_values(documents.iter().map(|d| d.line_end))),
        Arc::new(StringArray::from(
            documents.iter().map(|d| d.parent_id.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            documents.iter().map(|d| d.full_parent_text.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            documents.iter().map(|d| d.package_name.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from_iter_values(imports.iter().map(String::as_str))),
        Arc::new(BooleanArray::from(
            documents.iter().map(|d| d.is_test).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            documents.iter().map(|d| d.content_hash.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            documents.iter().map(|d| d.generated_at.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from(
            documents.iter().map(|d| d.file_count).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            sparse.iter().map(Option::as_deref).collect::<Vec<_>>(),
        )),
    ];

    RecordBatch::try_new(schema, arrays)
        .map_err(|e| ReviewError::Database(format!("Failed to create record batch: {}", e)))
}

async fn read_stream(
    mut results: lancedb::arrow::SendableRecordBatchStream,
) -> Result<Vec<(IndexedDocument, Option<f32>)>> {
    let mut documents = Vec::new();

    while let Some(batch) = results
        .try_next()
        .await
        .map_err(|e| ReviewError::Database(format!("Failed to read result stream: {}", e)))?
    {
        documents.extend(parse_batch(&batch)?);
    }

    debug!("Parsed {} documents from stream", documents.len());
    Ok(documents)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| ReviewError::Database(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ReviewError::Database(format!("Invalid {} column type", name)))
}

fn optional_string(array: &StringArray, row: usize) -> Option<String> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row).to_string())
    }
}

fn parse_batch(batch: &RecordBatch) -> Result<Vec<(IndexedDocument, Option<f32>)>> {
    let ids = column::<StringArray>(batch, "id")?;
    let vectors = column::<FixedSizeListArray>(batch, "vector")?;
    let contents = column::<StringArray>(batch, "content")?;
    let sources = column::<StringArray>(batch, "source")?;
    let kinds = column::<StringArray>(batch, "chunk_kind")?;
    let identifiers = column::<StringArray>(batch, "identifier")?;
    let line_starts = column::<UInt32Array>(batch, "line_start")?;
    let line_ends = column::<UInt32Array>(batch, "line_end")?;
    let parent_ids = column::<StringArray>(batch, "parent_id")?;
    let parent_texts = column::<StringArray>(batch, "full_parent_text")?;
    let packages = column::<StringArray>(batch, "package_name")?;
    let imports = column::<StringArray>(batch, "imports")?;
    let is_tests = column::<BooleanArray>(batch, "is_test")?;
    let content_hashes = column::<StringArray>(batch, "content_hash")?;
    let generated_ats = column::<StringArray>(batch, "generated_at")?;
    let file_counts = column::<UInt32Array>(batch, "file_count")?;
    let sparse = column::<StringArray>(batch, "sparse")?;

    // Extract distance scores if available
    let distances = batch
        .column_by_name("_distance")
        .and_then(|col| col.as_any().downcast_ref::<Float32Array>());

    let mut parsed = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let vector = vectors
            .value(row)
            .as_any()
            .downcast_ref::<Float32Array>()
            .map(|values| values.values().to_vec())
            .unwrap_or_default();

        let document = IndexedDocument {
            id: ids.value(row).to_string(),
            content: contents.value(row).to_string(),
            source: sources.value(row).to_string(),
            chunk_kind: ChunkKind::parse(kinds.value(row)).unwrap_or(ChunkKind::Code),
            identifier: optional_string(identifiers, row),
            line_start: line_starts.value(row),
            line_end: line_ends.value(row),
            parent_id: optional_string(parent_ids, row),
            full_parent_text: optional_string(parent_texts, row),
            package_name: optional_string(packages, row),
            imports: decode_imports(imports.value(row)),
            is_test: is_tests.value(row),
            content_hash: optional_string(content_hashes, row),
            generated_at: optional_string(generated_ats, row),
            file_count: (!file_counts.is_null(row)).then(|| file_counts.value(row)),
            vector,
            sparse: optional_string(sparse, row)
                .and_then(|json| serde_json::from_str::<SparseVector>(&json).ok()),
        };

        let distance = distances.and_then(|d| (!d.is_null(row)).then(|| d.value(row)));
        parsed.push((document, distance));
    }

    Ok(parsed)
}

/// Quote a string literal for a LanceDB SQL predicate
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a filter as a LanceDB SQL predicate.
///
/// The import filters use LIKE, which treats `_` and `%` as wildcards; callers re-check
/// results with [`DocumentFilter::matches`].
fn filter_to_sql(filter: &DocumentFilter) -> String {
    match filter {
        DocumentFilter::Source(source) => format!("source = {}", quote(source)),
        DocumentFilter::Sources(sources) if sources.is_empty() => "false".to_string(),
        DocumentFilter::Sources(sources) => format!(
            "source IN ({})",
            sources.iter().map(|s| quote(s)).join(", ")
        ),
        DocumentFilter::ChunkKind(kind) => format!("chunk_kind = '{}'", kind.as_str()),
        DocumentFilter::ImportsPackage(package) => {
            format!("imports LIKE {}", quote(&format!("%|{}|%", package)))
        }
        DocumentFilter::ImportsPathSuffix(suffix) => format!(
            "(imports LIKE {} OR imports LIKE {})",
            quote(&format!("%|{}|%", suffix)),
            quote(&format!("%/{}|%", suffix))
        ),
        DocumentFilter::And(filters) if filters.is_empty() => "true".to_string(),
        DocumentFilter::And(filters) => filters
            .iter()
            .map(|f| format!("({})", filter_to_sql(f)))
            .join(" AND "),
    }
}
