use std::path::Path;

use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    TantivyDocument,
    collector::TopDocs,
    doc,
    query::QueryParser,
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};

use crate::error::Result;

/// Field names used in the schema.
pub mod fields {
    pub const PASSAGE_ID: &str = "passage_id";
    pub const BODY: &str = "body";
}

/// Writer memory budget for a single indexing pass.
pub const WRITER_MEMORY_BUDGET: usize = 50_000_000;

/// BM25 index over passage text, keyed by passage id.
///
/// Passage text is indexed but not stored; callers keep the content next to
/// their own passage records and use this index only to find candidates.
pub struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    fields: LexicalFields,
}

#[derive(Debug, Clone, Copy)]
struct LexicalFields {
    passage_id: Field,
    body: Field,
}

/// A passage matched by a lexical query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexicalHit {
    pub passage_id: u64,
    pub score: f32,
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    builder.add_u64_field(fields::PASSAGE_ID, INDEXED | STORED | FAST);

    let body_opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer("en_stem")
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    builder.add_text_field(fields::BODY, body_opts);

    builder.build()
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register("en_stem", en_stem);
}

impl LexicalIndex {
    /// Open the index in `dir`, creating it if the directory holds none.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
        let index = if Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            Index::open(mmap_dir)?
        } else {
            Index::create(
                mmap_dir,
                build_schema(),
                tantivy::IndexSettings::default(),
            )?
        };

        Self::from_index(index)
    }

    /// Create a throwaway index held entirely in memory.
    pub fn open_in_ram() -> Result<Self> {
        Self::from_index(Index::create_in_ram(build_schema()))
    }

    fn from_index(index: Index) -> Result<Self> {
        register_tokenizers(&index);
        let schema = index.schema();
        let fields = LexicalFields {
            passage_id: schema.get_field(fields::PASSAGE_ID)?,
            body: schema.get_field(fields::BODY)?,
        };
        let reader = index.reader()?;

        Ok(Self {
            index,
            reader,
            fields,
        })
    }

    /// Index a batch of `(passage_id, text)` pairs and commit.
    pub fn add_passages<'a, I>(&self, passages: I) -> Result<usize>
    where
        I: IntoIterator<Item = (u64, &'a str)>,
    {
        let mut writer: IndexWriter = self.index.writer(WRITER_MEMORY_BUDGET)?;
        let mut added = 0;
        for (passage_id, body) in passages {
            writer.add_document(doc!(
                self.fields.passage_id => passage_id,
                self.fields.body => body,
            ))?;
            added += 1;
        }
        writer.commit()?;
        writer.wait_merging_threads()?;
        Ok(added)
    }

    /// Best `limit` passages for `query` by BM25 score.
    ///
    /// Query syntax errors are tolerated; unparsable fragments are dropped.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<LexicalHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let parser = QueryParser::for_index(&self.index, vec![self.fields.body]);
        let (parsed, _errors) = parser.parse_query_lenient(query);
        let top_docs = searcher.search(&parsed, &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            if let Some(passage_id) = doc
                .get_first(self.fields.passage_id)
                .and_then(|v| v.as_u64())
            {
                hits.push(LexicalHit { passage_id, score });
            }
        }

        Ok(hits)
    }

    /// Number of indexed passages.
    pub fn num_passages(&self) -> Result<u64> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }
}

impl std::fmt::Debug for LexicalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LexicalIndex").finish_non_exhaustive()
    }
}
