//! Reading items back
//!
//! Reconstruction reads each table of the item once and regroups its rows
//! by list position, so list order is rebuilt independently of the order
//! the store returns rows in.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::resource::{decode_value, ResourceDefinition};
use super::schema::{child_table, position_columns, ObjectShape};
use super::search::{Projection, SearchParam, SearchResult, SortParam};
use crate::sql::{ColumnType, Condition, Row, Select, SqlValue, Transaction, LINK_COLUMN};

/// Rows of one list table, keyed by the positions of their parent element
type Grouped<T> = BTreeMap<Vec<i64>, Vec<T>>;

/// Reads and searches items of one resource type
#[derive(Debug, Clone)]
pub struct ReadOnlyStorage {
    definition: ResourceDefinition,
}

impl ReadOnlyStorage {
    pub fn new(definition: ResourceDefinition) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &ResourceDefinition {
        &self.definition
    }

    /// Ids of all stored items, oldest first
    pub fn get_item_ids(&self, t: &Transaction<'_>) -> StorageResult<Vec<String>> {
        let rows = t.select(self.definition.root_table(), &[LINK_COLUMN], None)?;
        Ok(rows.iter().filter_map(|row| text(row, LINK_COLUMN)).collect())
    }

    pub fn get_item(&self, t: &Transaction<'_>, item_id: &str) -> StorageResult<Value> {
        let item = read_object(
            t,
            self.definition.root_table(),
            item_id,
            self.definition.shape(),
            None,
        )?;
        Ok(Value::Object(item))
    }

    /// Like [`get_item`](Self::get_item), restricted to some top-level fields
    ///
    /// `id` is always included. Unknown names are ignored.
    pub fn get_item_fields(
        &self,
        t: &Transaction<'_>,
        item_id: &str,
        fields: &[&str],
    ) -> StorageResult<Value> {
        let mut names: Vec<&str> = fields.to_vec();
        if !names.contains(&LINK_COLUMN) {
            names.push(LINK_COLUMN);
        }
        let item = read_object(
            t,
            self.definition.root_table(),
            item_id,
            self.definition.shape(),
            Some(names.as_slice()),
        )?;
        Ok(Value::Object(item))
    }

    pub fn get_subitem(
        &self,
        t: &Transaction<'_>,
        item_id: &str,
        subitem_name: &str,
    ) -> StorageResult<Value> {
        let subitem = self.definition.subitem(subitem_name)?;
        let object = read_object(t, subitem.root_table(), item_id, subitem.shape(), None)?;
        Ok(Value::Object(object))
    }

    /// Find items matching every param
    ///
    /// Matches are ordered by `sort` (insertion order when empty), then
    /// `offset` rows are skipped and at most `limit` returned.
    pub fn search(
        &self,
        t: &Transaction<'_>,
        params: &[SearchParam],
        projection: &Projection,
        sort: &[SortParam],
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> StorageResult<SearchResult> {
        let schema = self.definition.schema();
        let conditions = params
            .iter()
            .map(|p| p.to_condition(schema))
            .collect::<StorageResult<Vec<_>>>()?;

        let mut select = Select::new(self.definition.root_table(), &[LINK_COLUMN])
            .limit(limit)
            .offset(offset);
        if !conditions.is_empty() {
            select = select.filter(Condition::and(conditions));
        }
        for param in sort {
            select = select.order_by(param.to_sort_key(schema)?);
        }

        let ids: Vec<String> = t
            .query(&select)?
            .iter()
            .filter_map(|row| text(row, LINK_COLUMN))
            .collect();
        debug!(
            "Search on {} matched {} items",
            self.definition.resource_type(),
            ids.len()
        );

        let resources: Vec<Value> = match projection {
            Projection::IdsOnly => ids
                .into_iter()
                .map(|id| {
                    let mut item = Map::new();
                    item.insert(LINK_COLUMN.to_string(), Value::String(id));
                    Value::Object(item)
                })
                .collect(),
            Projection::All => ids
                .iter()
                .map(|id| self.get_item(t, id))
                .collect::<StorageResult<_>>()?,
            Projection::Fields(fields) => {
                let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
                ids.iter()
                    .map(|id| self.get_item_fields(t, id, &fields))
                    .collect::<StorageResult<_>>()?
            }
        };
        Ok(SearchResult { resources })
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    row.get(column).and_then(SqlValue::as_str).map(str::to_string)
}

fn wanted(filter: Option<&[&str]>, name: &str) -> bool {
    filter.map_or(true, |names| names.contains(&name))
}

/// Rebuild the object stored at root table `table` for `item_id`
fn read_object(
    t: &Transaction<'_>,
    table: &str,
    item_id: &str,
    shape: &ObjectShape,
    filter: Option<&[&str]>,
) -> StorageResult<Map<String, Value>> {
    let scalars: Vec<&(String, ColumnType)> = shape
        .scalars
        .iter()
        .filter(|(name, _)| wanted(filter, name))
        .collect();
    let mut columns: Vec<&str> = scalars.iter().map(|(name, _)| name.as_str()).collect();
    if columns.is_empty() {
        columns.push(LINK_COLUMN);
    }

    let rows = t.select(
        table,
        &columns,
        Some(&Condition::eq(table, LINK_COLUMN, item_id)),
    )?;
    let row = rows.first().ok_or_else(|| StorageError::ItemDoesNotExist {
        item_id: item_id.to_string(),
    })?;

    let mut object = Map::new();
    for (name, column_type) in scalars {
        let value = row.get(name).unwrap_or(&SqlValue::Null);
        object.insert(name.clone(), decode_value(value, *column_type));
    }

    for (name, column_type) in &shape.scalar_lists {
        if wanted(filter, name) {
            let list_table = child_table(table, name)?;
            let mut lists = read_scalar_list(t, &list_table, item_id, 1, name, *column_type)?;
            let values = lists.remove(&Vec::new()).unwrap_or_default();
            object.insert(name.clone(), Value::Array(values));
        }
    }
    for (name, element) in &shape.object_lists {
        if wanted(filter, name) {
            let list_table = child_table(table, name)?;
            let mut lists = read_object_list(t, &list_table, item_id, 1, element)?;
            let values = lists.remove(&Vec::new()).unwrap_or_default();
            object.insert(
                name.clone(),
                Value::Array(values.into_iter().map(Value::Object).collect()),
            );
        }
    }
    Ok(object)
}

/// Rows of list table `table` at nesting `level`, grouped by parent and in order
fn read_list_rows(
    t: &Transaction<'_>,
    table: &str,
    item_id: &str,
    level: usize,
    value_columns: &[&str],
) -> StorageResult<Grouped<(Vec<i64>, Row)>> {
    let positions = position_columns(level);
    let columns: Vec<&str> = positions
        .iter()
        .chain(value_columns.iter())
        .copied()
        .collect();
    let rows = t.select(
        table,
        &columns,
        Some(&Condition::eq(table, LINK_COLUMN, item_id)),
    )?;

    let mut grouped: Grouped<(Vec<i64>, Row)> = BTreeMap::new();
    for row in rows {
        let key: Vec<i64> = positions
            .iter()
            .map(|p| row.get(*p).and_then(SqlValue::as_i64).unwrap_or_default())
            .collect();
        let parent = key[..key.len() - 1].to_vec();
        grouped.entry(parent).or_default().push((key, row));
    }
    for rows in grouped.values_mut() {
        rows.sort_by(|a, b| a.0.cmp(&b.0));
    }
    Ok(grouped)
}

fn read_scalar_list(
    t: &Transaction<'_>,
    table: &str,
    item_id: &str,
    level: usize,
    field: &str,
    column_type: ColumnType,
) -> StorageResult<Grouped<Value>> {
    let grouped = read_list_rows(t, table, item_id, level, &[field])?;
    Ok(grouped
        .into_iter()
        .map(|(parent, rows)| {
            let values = rows
                .iter()
                .map(|(_, row)| {
                    decode_value(row.get(field).unwrap_or(&SqlValue::Null), column_type)
                })
                .collect();
            (parent, values)
        })
        .collect())
}

fn read_object_list(
    t: &Transaction<'_>,
    table: &str,
    item_id: &str,
    level: usize,
    shape: &ObjectShape,
) -> StorageResult<Grouped<Map<String, Value>>> {
    let scalar_names: Vec<&str> = shape.scalars.iter().map(|(n, _)| n.as_str()).collect();
    let grouped = read_list_rows(t, table, item_id, level, &scalar_names)?;

    let mut scalar_lists = Vec::new();
    for (name, column_type) in &shape.scalar_lists {
        let list_table = child_table(table, name)?;
        let lists = read_scalar_list(t, &list_table, item_id, level + 1, name, *column_type)?;
        scalar_lists.push((name, lists));
    }
    let mut object_lists = Vec::new();
    for (name, element) in &shape.object_lists {
        let list_table = child_table(table, name)?;
        let lists = read_object_list(t, &list_table, item_id, level + 1, element)?;
        object_lists.push((name, lists));
    }

    let mut result: Grouped<Map<String, Value>> = BTreeMap::new();
    for (parent, rows) in grouped {
        let objects = result.entry(parent).or_default();
        for (key, row) in rows {
            let mut object = Map::new();
            for (name, column_type) in &shape.scalars {
                let value = row.get(name).unwrap_or(&SqlValue::Null);
                object.insert(name.clone(), decode_value(value, *column_type));
            }
            for (name, lists) in &mut scalar_lists {
                let values = lists.remove(&key).unwrap_or_default();
                object.insert(name.to_string(), Value::Array(values));
            }
            for (name, lists) in &mut object_lists {
                let values = lists.remove(&key).unwrap_or_default();
                object.insert(
                    name.to_string(),
                    Value::Array(values.into_iter().map(Value::Object).collect()),
                );
            }
            objects.push(object);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Database;
    use crate::storage::schema::TableScope;
    use crate::storage::search::MatchRule;
    use crate::storage::versioned::VersionedStorage;
    use crate::storage::write_only::WriteOnlyStorage;
    use serde_json::json;

    fn prototype() -> Value {
        json!({
            "type": "",
            "id": "",
            "revision": "",
            "foo": "",
            "bar": [""],
            "ok": false,
            "score": 0,
            "dicts": [{"baz": "", "foobar": [""]}],
        })
    }

    fn subitem_prototype() -> Value {
        json!({"secret": ""})
    }

    struct Fixture {
        db: Database,
        wo: WriteOnlyStorage,
        ro: ReadOnlyStorage,
    }

    impl Fixture {
        fn new() -> Self {
            let mut db = Database::open_in_memory().unwrap();
            let vs = VersionedStorage::builder("yo")
                .start_version("1")
                .add_prototype(prototype(), TableScope::Main)
                .add_prototype(subitem_prototype(), TableScope::Subpath("sub".into()))
                .build()
                .unwrap();
            db.with_transaction(|t| vs.prepare_storage(t)).unwrap();

            let definition = ResourceDefinition::new("yo", prototype())
                .unwrap()
                .with_subitem("sub", subitem_prototype())
                .unwrap();
            Self {
                db,
                wo: WriteOnlyStorage::new(definition.clone()),
                ro: ReadOnlyStorage::new(definition),
            }
        }

        fn add(&mut self, items: &[Value]) -> Vec<Value> {
            let wo = &self.wo;
            self.db
                .with_transaction(|t| {
                    items
                        .iter()
                        .map(|item| wo.add_item(t, item))
                        .collect::<StorageResult<Vec<_>>>()
                })
                .unwrap()
        }

        fn search(
            &mut self,
            params: &[SearchParam],
            sort: &[SortParam],
            limit: Option<i64>,
            offset: Option<i64>,
        ) -> StorageResult<Vec<Value>> {
            let t = self.db.begin()?;
            let result = self
                .ro
                .search(&t, params, &Projection::All, sort, limit, offset)?;
            Ok(result.resources)
        }
    }

    fn field<'a>(items: &'a [Value], name: &str) -> Vec<&'a str> {
        items.iter().filter_map(|i| i[name].as_str()).collect()
    }

    fn foos(values: &[&str]) -> Vec<Value> {
        values.iter().map(|v| json!({"foo": v})).collect()
    }

    #[test]
    fn test_get_item_missing() {
        let mut fx = Fixture::new();
        let t = fx.db.begin().unwrap();
        assert!(matches!(
            fx.ro.get_item(&t, "does-not-exist"),
            Err(StorageError::ItemDoesNotExist { .. })
        ));
        assert!(fx.ro.get_item_ids(&t).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_subitem() {
        let mut fx = Fixture::new();
        let added = fx.add(&foos(&["a"]));
        let t = fx.db.begin().unwrap();
        assert!(matches!(
            fx.ro.get_subitem(&t, added[0]["id"].as_str().unwrap(), "photo"),
            Err(StorageError::UnknownSubitem { .. })
        ));
    }

    #[test]
    fn test_get_item_fields() {
        let mut fx = Fixture::new();
        let added = fx.add(&[json!({"foo": "x", "bar": ["1", "2"], "score": 3})]);
        let id = added[0]["id"].as_str().unwrap();

        let t = fx.db.begin().unwrap();
        let item = fx.ro.get_item_fields(&t, id, &["bar", "score"]).unwrap();
        assert_eq!(item, json!({"id": id, "bar": ["1", "2"], "score": 3}));
    }

    #[test]
    fn test_search_limit_and_offset() {
        let mut fx = Fixture::new();
        fx.add(&foos(&["a", "b", "c", "d", "e"]));
        let sort = [SortParam::asc("foo")];

        let found = fx.search(&[], &sort, Some(3), None).unwrap();
        assert_eq!(field(&found, "foo"), vec!["a", "b", "c"]);

        let found = fx.search(&[], &sort, None, Some(2)).unwrap();
        assert_eq!(field(&found, "foo"), vec!["c", "d", "e"]);

        let found = fx.search(&[], &sort, Some(2), Some(1)).unwrap();
        assert_eq!(field(&found, "foo"), vec!["b", "c"]);
    }

    #[test]
    fn test_unsorted_search_keeps_insertion_order() {
        let mut fx = Fixture::new();
        fx.add(&foos(&["c", "a", "e", "b", "d"]));

        let found = fx.search(&[], &[], None, None).unwrap();
        assert_eq!(field(&found, "foo"), vec!["c", "a", "e", "b", "d"]);

        let found = fx.search(&[], &[], Some(2), Some(1)).unwrap();
        assert_eq!(field(&found, "foo"), vec!["a", "e"]);
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let mut fx = Fixture::new();
        fx.add(&foos(&["James Bond", "Miss Moneypenny"]));

        let params = [SearchParam::exact("foo", "JAMES BOND")];
        let found = fx.search(&params, &[], None, None).unwrap();
        assert_eq!(field(&found, "foo"), vec!["James Bond"]);

        let params = [SearchParam::new(MatchRule::StartsWith, "foo", "miss")];
        let found = fx.search(&params, &[], None, None).unwrap();
        assert_eq!(field(&found, "foo"), vec!["Miss Moneypenny"]);

        let params = [SearchParam::new(MatchRule::Contains, "foo", "ND")];
        let found = fx.search(&params, &[], None, None).unwrap();
        assert_eq!(field(&found, "foo"), vec!["James Bond"]);
    }

    #[test]
    fn test_params_are_satisfied_by_different_rows() {
        let mut fx = Fixture::new();
        fx.add(&[
            json!({"foo": "one", "dicts": [{"baz": "x"}, {"baz": "y"}]}),
            json!({"foo": "two", "dicts": [{"baz": "x"}]}),
        ]);

        let params = [SearchParam::exact("baz", "x"), SearchParam::exact("baz", "y")];
        let found = fx.search(&params, &[], None, None).unwrap();
        assert_eq!(field(&found, "foo"), vec!["one"]);

        let params = [SearchParam::any(MatchRule::Exact, "baz", ["y", "nope"])];
        let found = fx.search(&params, &[], None, None).unwrap();
        assert_eq!(field(&found, "foo"), vec!["one"]);
    }

    #[test]
    fn test_search_nested_scalar_list_and_subitem() {
        let mut fx = Fixture::new();
        fx.add(&[
            json!({"foo": "a", "dicts": [{"baz": "", "foobar": ["deep"]}]}),
            json!({"foo": "b"}),
        ]);

        let params = [SearchParam::exact("foobar", "deep")];
        let found = fx.search(&params, &[], None, None).unwrap();
        assert_eq!(field(&found, "foo"), vec!["a"]);

        // Fresh subitems hold empty strings
        let params = [SearchParam::exact("secret", "")];
        let found = fx.search(&params, &[], None, None).unwrap();
        assert_eq!(field(&found, "foo"), vec!["a", "b"]);
    }

    #[test]
    fn test_search_by_bool_and_number() {
        let mut fx = Fixture::new();
        fx.add(&[
            json!({"foo": "a", "ok": true, "score": 10}),
            json!({"foo": "b", "ok": false, "score": 20}),
            json!({"foo": "c", "ok": true, "score": 30}),
        ]);

        let params = [SearchParam::exact("ok", "true")];
        let found = fx.search(&params, &[], None, None).unwrap();
        assert_eq!(field(&found, "foo"), vec!["a", "c"]);

        let params = [SearchParam::new(MatchRule::Ge, "score", "20")];
        let found = fx.search(&params, &[SortParam::desc("score")], None, None).unwrap();
        assert_eq!(field(&found, "foo"), vec!["c", "b"]);
    }

    #[test]
    fn test_sort_by_first_instance_of_list_of_objects() {
        let mut fx = Fixture::new();
        fx.add(&[
            json!({"foo": "1", "dicts": [{"baz": "b"}, {"baz": "a"}]}),
            json!({"foo": "2", "dicts": [{"baz": "c"}, {"baz": "b"}]}),
            json!({"foo": "3", "dicts": [{"baz": "a"}, {"baz": "c"}]}),
        ]);

        let found = fx.search(&[], &[SortParam::asc("baz")], None, None).unwrap();
        let first_baz: Vec<_> = found
            .iter()
            .map(|i| i["dicts"][0]["baz"].as_str().unwrap())
            .collect();
        assert_eq!(first_baz, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sort_by_first_instance_of_scalar_list() {
        let mut fx = Fixture::new();
        fx.add(&[
            json!({"foo": "1", "bar": ["y", "a"]}),
            json!({"foo": "2", "bar": ["x", "z"]}),
            json!({"foo": "3", "bar": ["z", "b"]}),
        ]);

        let found = fx.search(&[], &[SortParam::asc("bar")], None, None).unwrap();
        assert_eq!(field(&found, "foo"), vec!["2", "1", "3"]);

        let found = fx.search(&[], &[SortParam::desc("bar")], None, None).unwrap();
        assert_eq!(field(&found, "foo"), vec!["3", "1", "2"]);
    }

    #[test]
    fn test_sort_by_multiple_keys() {
        let mut fx = Fixture::new();
        fx.add(&[
            json!({"foo": "a", "bar": ["x"]}),
            json!({"foo": "a", "bar": ["z"]}),
            json!({"foo": "a", "bar": ["y"]}),
            json!({"foo": "b", "bar": ["a"]}),
        ]);

        let sort = [SortParam::asc("foo"), SortParam::desc("bar")];
        let found = fx.search(&[], &sort, None, None).unwrap();
        let pairs: Vec<_> = found
            .iter()
            .map(|i| (i["foo"].as_str().unwrap(), i["bar"][0].as_str().unwrap()))
            .collect();
        assert_eq!(pairs, vec![("a", "z"), ("a", "y"), ("a", "x"), ("b", "a")]);
    }

    #[test]
    fn test_sort_booleans_false_first() {
        let mut fx = Fixture::new();
        fx.add(&[
            json!({"foo": "t1", "ok": true}),
            json!({"foo": "f1", "ok": false}),
            json!({"foo": "t2", "ok": true}),
        ]);

        let found = fx.search(&[], &[SortParam::asc("ok")], None, None).unwrap();
        assert_eq!(field(&found, "foo"), vec!["f1", "t1", "t2"]);
    }

    #[test]
    fn test_unknown_fields_are_errors() {
        let mut fx = Fixture::new();
        fx.add(&foos(&["a"]));

        assert!(matches!(
            fx.search(&[SearchParam::exact("nope", "x")], &[], None, None),
            Err(StorageError::FieldNotInResource { .. })
        ));
        assert!(matches!(
            fx.search(&[], &[SortParam::asc("nope")], None, None),
            Err(StorageError::FieldNotInResource { .. })
        ));
        assert!(matches!(
            fx.search(&[], &[SortParam::asc("dicts")], None, None),
            Err(StorageError::FieldNotInResource { .. })
        ));
    }

    #[test]
    fn test_projections() {
        let mut fx = Fixture::new();
        let added = fx.add(&[json!({"foo": "a", "score": 1})]);
        let id = added[0]["id"].as_str().unwrap();

        let t = fx.db.begin().unwrap();
        let result = fx
            .ro
            .search(&t, &[], &Projection::IdsOnly, &[], None, None)
            .unwrap();
        assert_eq!(result.resources, vec![json!({"id": id})]);
        assert_eq!(result.ids(), vec![id]);

        let result = fx
            .ro
            .search(&t, &[], &Projection::Fields(vec!["foo".into()]), &[], None, None)
            .unwrap();
        assert_eq!(result.resources, vec![json!({"id": id, "foo": "a"})]);

        let result = fx.ro.search(&t, &[], &Projection::All, &[], None, None).unwrap();
        assert_eq!(result.resources, added);
    }
}
