use crate::error::MeshError;
use crate::OperationKind;
use graphql_parser::parse_query;
use graphql_parser::query::{
    Definition, Document, OperationDefinition, Selection, SelectionSet, Type, Value,
    VariableDefinition,
};
use serde_json::json;
use std::collections::BTreeSet;

/// An argument value as written in the document. Variables stay symbolic
/// until execution supplies their values.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Enum(String),
    Var(String),
    List(Vec<ArgValue>),
    Object(Vec<(String, ArgValue)>),
}

impl ArgValue {
    /// Resolves to JSON, substituting variables from the given object.
    pub fn resolve(&self, variables: &serde_json::Value) -> serde_json::Value {
        match self {
            ArgValue::Null => serde_json::Value::Null,
            ArgValue::Bool(b) => json!(b),
            ArgValue::Int(n) => json!(n),
            ArgValue::Float(f) => json!(f),
            ArgValue::Str(s) => json!(s),
            ArgValue::Enum(name) => json!(name),
            ArgValue::Var(name) => variables.get(name).cloned().unwrap_or(serde_json::Value::Null),
            ArgValue::List(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.resolve(variables)).collect())
            }
            ArgValue::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve(variables)))
                    .collect(),
            ),
        }
    }
}

/// One variable declared by an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct VariableDef {
    pub name: String,
    pub type_text: String,
    pub default_text: Option<String>,
}

/// One field selected at the operation root, kept as printed text so a
/// delegated operation can be reassembled without holding parser lifetimes.
#[derive(Clone, Debug)]
pub struct RootField {
    pub alias: Option<String>,
    pub name: String,
    /// Key the field occupies in the response (`alias` when present).
    pub response_key: String,
    /// The full printed field: alias, name, arguments, selection.
    pub text: String,
    /// Printed selection set including braces, absent for leaf selections.
    pub selection_text: Option<String>,
    /// Total number of selections nested under this field.
    pub selection_count: usize,
    pub arguments: Vec<(String, ArgValue)>,
    /// Variables referenced anywhere inside this field.
    pub used_variables: Vec<String>,
    /// Names of fragments spread anywhere inside this field.
    pub fragment_spreads: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct OperationInfo {
    pub name: Option<String>,
    pub kind: OperationKind,
    pub variable_defs: Vec<VariableDef>,
    pub root_fields: Vec<RootField>,
}

#[derive(Clone, Debug)]
pub struct FragmentInfo {
    pub name: String,
    pub text: String,
    pub used_variables: Vec<String>,
    /// Fragments this fragment spreads in turn.
    pub fragment_spreads: Vec<String>,
}

/// A parsed request document, reduced to the owned pieces the gateway works
/// with: operations, their root-field branches, and fragment definitions.
#[derive(Clone, Debug)]
pub struct ParsedDocument {
    pub text: String,
    pub operations: Vec<OperationInfo>,
    pub fragments: Vec<FragmentInfo>,
}

impl ParsedDocument {
    pub fn parse(text: &str) -> Result<Self, MeshError> {
        let document: Document<'_, String> =
            parse_query(text).map_err(|e| MeshError::Parse(e.to_string()))?;

        let mut operations = Vec::new();
        let mut fragments = Vec::new();

        for definition in &document.definitions {
            match definition {
                Definition::Operation(op) => operations.push(extract_operation(op)?),
                Definition::Fragment(fragment) => {
                    let mut used = BTreeSet::new();
                    let mut spreads = BTreeSet::new();
                    collect_selection_variables(&fragment.selection_set, &mut used);
                    collect_fragment_spreads(&fragment.selection_set, &mut spreads);
                    let type_condition = match &fragment.type_condition {
                        graphql_parser::query::TypeCondition::On(name) => name.clone(),
                    };
                    fragments.push(FragmentInfo {
                        name: fragment.name.clone(),
                        text: format!(
                            "fragment {} on {} {}",
                            fragment.name,
                            type_condition,
                            print_selection_set(&fragment.selection_set)
                        ),
                        used_variables: used.into_iter().collect(),
                        fragment_spreads: spreads.into_iter().collect(),
                    });
                }
            }
        }

        if operations.is_empty() {
            return Err(MeshError::Parse(
                "document declares no executable operation".into(),
            ));
        }

        Ok(ParsedDocument {
            text: text.to_string(),
            operations,
            fragments,
        })
    }

    /// Picks the operation to run: by name when given, otherwise the
    /// document's single operation.
    pub fn operation(&self, name: Option<&str>) -> Result<&OperationInfo, MeshError> {
        match name {
            Some(wanted) => self
                .operations
                .iter()
                .find(|op| op.name.as_deref() == Some(wanted))
                .ok_or_else(|| MeshError::Parse(format!("unknown operation \"{wanted}\""))),
            None if self.operations.len() == 1 => Ok(&self.operations[0]),
            None => Err(MeshError::Parse(
                "operation name required for a multi-operation document".into(),
            )),
        }
    }

    pub fn fragment(&self, name: &str) -> Option<&FragmentInfo> {
        self.fragments.iter().find(|f| f.name == name)
    }
}

fn extract_operation(op: &OperationDefinition<'_, String>) -> Result<OperationInfo, MeshError> {
    let (kind, name, variable_definitions, selection_set) = match op {
        OperationDefinition::SelectionSet(selection_set) => {
            (OperationKind::Query, None, &[] as &[_], selection_set)
        }
        OperationDefinition::Query(q) => (
            OperationKind::Query,
            q.name.clone(),
            q.variable_definitions.as_slice(),
            &q.selection_set,
        ),
        OperationDefinition::Mutation(m) => (
            OperationKind::Mutation,
            m.name.clone(),
            m.variable_definitions.as_slice(),
            &m.selection_set,
        ),
        OperationDefinition::Subscription(s) => (
            OperationKind::Subscription,
            s.name.clone(),
            s.variable_definitions.as_slice(),
            &s.selection_set,
        ),
    };

    let mut root_fields = Vec::new();
    for selection in &selection_set.items {
        match selection {
            Selection::Field(field) => {
                let selection_text = if field.selection_set.items.is_empty() {
                    None
                } else {
                    Some(print_selection_set(&field.selection_set))
                };
                let mut used = BTreeSet::new();
                let mut spreads = BTreeSet::new();
                for (_, value) in &field.arguments {
                    collect_value_variables(value, &mut used);
                }
                collect_selection_variables(&field.selection_set, &mut used);
                collect_fragment_spreads(&field.selection_set, &mut spreads);
                root_fields.push(RootField {
                    alias: field.alias.clone(),
                    name: field.name.clone(),
                    response_key: field.alias.clone().unwrap_or_else(|| field.name.clone()),
                    text: print_field(field),
                    selection_text,
                    selection_count: count_selections(&field.selection_set),
                    arguments: field
                        .arguments
                        .iter()
                        .map(|(name, value)| (name.clone(), to_arg_value(value)))
                        .collect(),
                    used_variables: used.into_iter().collect(),
                    fragment_spreads: spreads.into_iter().collect(),
                });
            }
            // Root-level fragments cannot be routed per owning source, so the
            // gateway rejects them up front instead of mis-planning.
            Selection::FragmentSpread(_) | Selection::InlineFragment(_) => {
                return Err(MeshError::Parse(
                    "fragments at the operation root are not supported".into(),
                ));
            }
        }
    }

    Ok(OperationInfo {
        name,
        kind,
        variable_defs: variable_definitions.iter().map(to_variable_def).collect(),
        root_fields,
    })
}

fn to_variable_def(def: &VariableDefinition<'_, String>) -> VariableDef {
    VariableDef {
        name: def.name.clone(),
        type_text: print_type(&def.var_type),
        default_text: def.default_value.as_ref().map(print_value),
    }
}

fn to_arg_value(value: &Value<'_, String>) -> ArgValue {
    match value {
        Value::Variable(name) => ArgValue::Var(name.clone()),
        Value::Int(n) => ArgValue::Int(n.as_i64().unwrap_or_default()),
        Value::Float(f) => ArgValue::Float(*f),
        Value::String(s) => ArgValue::Str(s.clone()),
        Value::Boolean(b) => ArgValue::Bool(*b),
        Value::Null => ArgValue::Null,
        Value::Enum(name) => ArgValue::Enum(name.clone()),
        Value::List(items) => ArgValue::List(items.iter().map(to_arg_value).collect()),
        Value::Object(fields) => ArgValue::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), to_arg_value(v)))
                .collect(),
        ),
    }
}

fn count_selections(selection_set: &SelectionSet<'_, String>) -> usize {
    selection_set
        .items
        .iter()
        .map(|selection| match selection {
            Selection::Field(field) => 1 + count_selections(&field.selection_set),
            Selection::FragmentSpread(_) => 1,
            Selection::InlineFragment(inline) => count_selections(&inline.selection_set),
        })
        .sum()
}

fn collect_selection_variables(selection_set: &SelectionSet<'_, String>, out: &mut BTreeSet<String>) {
    for selection in &selection_set.items {
        match selection {
            Selection::Field(field) => {
                for (_, value) in &field.arguments {
                    collect_value_variables(value, out);
                }
                collect_selection_variables(&field.selection_set, out);
            }
            Selection::FragmentSpread(_) => {}
            Selection::InlineFragment(inline) => {
                collect_selection_variables(&inline.selection_set, out);
            }
        }
    }
}

fn collect_fragment_spreads(selection_set: &SelectionSet<'_, String>, out: &mut BTreeSet<String>) {
    for selection in &selection_set.items {
        match selection {
            Selection::Field(field) => collect_fragment_spreads(&field.selection_set, out),
            Selection::FragmentSpread(spread) => {
                out.insert(spread.fragment_name.clone());
            }
            Selection::InlineFragment(inline) => {
                collect_fragment_spreads(&inline.selection_set, out);
            }
        }
    }
}

fn collect_value_variables(value: &Value<'_, String>, out: &mut BTreeSet<String>) {
    match value {
        Value::Variable(name) => {
            out.insert(name.clone());
        }
        Value::List(items) => {
            for item in items {
                collect_value_variables(item, out);
            }
        }
        Value::Object(fields) => {
            for value in fields.values() {
                collect_value_variables(value, out);
            }
        }
        _ => {}
    }
}

// Printers below reassemble document text from the parser AST. Only the
// syntax the extractor keeps is printed; directives are dropped.

pub(crate) fn print_field(field: &graphql_parser::query::Field<'_, String>) -> String {
    let mut out = String::new();
    if let Some(alias) = &field.alias {
        out.push_str(alias);
        out.push_str(": ");
    }
    out.push_str(&field.name);
    if !field.arguments.is_empty() {
        let args: Vec<String> = field
            .arguments
            .iter()
            .map(|(name, value)| format!("{}: {}", name, print_value(value)))
            .collect();
        out.push('(');
        out.push_str(&args.join(", "));
        out.push(')');
    }
    if !field.selection_set.items.is_empty() {
        out.push(' ');
        out.push_str(&print_selection_set(&field.selection_set));
    }
    out
}

pub(crate) fn print_selection_set(selection_set: &SelectionSet<'_, String>) -> String {
    let items: Vec<String> = selection_set
        .items
        .iter()
        .map(|selection| match selection {
            Selection::Field(field) => print_field(field),
            Selection::FragmentSpread(spread) => format!("...{}", spread.fragment_name),
            Selection::InlineFragment(inline) => {
                let condition = match &inline.type_condition {
                    Some(graphql_parser::query::TypeCondition::On(name)) => {
                        format!(" on {name}")
                    }
                    None => String::new(),
                };
                format!(
                    "...{} {}",
                    condition,
                    print_selection_set(&inline.selection_set)
                )
            }
        })
        .collect();
    format!("{{ {} }}", items.join(" "))
}

pub(crate) fn print_value(value: &Value<'_, String>) -> String {
    match value {
        Value::Variable(name) => format!("${name}"),
        Value::Int(n) => n.as_i64().unwrap_or_default().to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| "\"\"".into()),
        Value::Boolean(b) => b.to_string(),
        Value::Null => "null".into(),
        Value::Enum(name) => name.clone(),
        Value::List(items) => {
            let printed: Vec<String> = items.iter().map(print_value).collect();
            format!("[{}]", printed.join(", "))
        }
        Value::Object(fields) => {
            let printed: Vec<String> = fields
                .iter()
                .map(|(k, v)| format!("{}: {}", k, print_value(v)))
                .collect();
            format!("{{{}}}", printed.join(", "))
        }
    }
}

pub(crate) fn print_type(ty: &Type<'_, String>) -> String {
    match ty {
        Type::NamedType(name) => name.clone(),
        Type::ListType(inner) => format!("[{}]", print_type(inner)),
        Type::NonNullType(inner) => format!("{}!", print_type(inner)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn extracts_root_fields_with_text() {
        let doc = ParsedDocument::parse(
            r#"query GetUser($id: ID!) {
                me: user(id: $id) { id name friends { id } }
                version
            }"#,
        )
        .unwrap();

        let op = doc.operation(None).unwrap();
        assert_eq!(op.kind, OperationKind::Query);
        assert_eq!(op.variable_defs[0].name, "id");
        assert_eq!(op.variable_defs[0].type_text, "ID!");

        let user = &op.root_fields[0];
        assert_eq!(user.response_key, "me");
        assert_eq!(user.name, "user");
        assert_eq!(user.text, "me: user(id: $id) { id name friends { id } }");
        assert_eq!(user.selection_count, 4);
        assert_eq!(user.used_variables, vec!["id".to_string()]);

        let version = &op.root_fields[1];
        assert_eq!(version.selection_text, None);
        assert_eq!(version.selection_count, 0);
    }

    #[test]
    fn resolves_argument_literals_and_variables() {
        let doc = ParsedDocument::parse(
            r#"query Q($name: String) { user(filter: {name: $name, active: true}, limit: 3) { id } }"#,
        )
        .unwrap();
        let field = &doc.operation(None).unwrap().root_fields[0];

        let variables = json!({"name": "ada"});
        let filter = field
            .arguments
            .iter()
            .find(|(name, _)| name == "filter")
            .map(|(_, value)| value.resolve(&variables))
            .unwrap();
        assert_eq!(filter, json!({"name": "ada", "active": true}));

        let limit = &field.arguments[1];
        assert_eq!(limit.1, ArgValue::Int(3));
    }

    #[test]
    fn keeps_fragments() {
        let doc = ParsedDocument::parse(
            r#"
            query { user(id: "1") { ...Core } }
            fragment Core on User { id name }
            "#,
        )
        .unwrap();
        let fragment = doc.fragment("Core").unwrap();
        assert_eq!(fragment.text, "fragment Core on User { id name }");
        assert_eq!(
            doc.operation(None).unwrap().root_fields[0].fragment_spreads,
            vec!["Core".to_string()]
        );
    }

    #[test]
    fn selects_operation_by_name() {
        let doc = ParsedDocument::parse("query A { a } query B { b }").unwrap();
        assert_eq!(doc.operation(Some("B")).unwrap().root_fields[0].name, "b");
        assert!(doc.operation(None).is_err());
        assert!(doc.operation(Some("C")).is_err());
    }

    #[test]
    fn rejects_root_fragments() {
        assert!(ParsedDocument::parse(
            "query { ...Root } fragment Root on Query { a }"
        )
        .is_err());
    }
}
