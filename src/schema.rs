use crate::error::MeshError;
use crate::OperationKind;
use graphql_parser::parse_schema;
use graphql_parser::schema::{self, Definition, TypeDefinition};
use std::collections::{HashMap, HashSet};

/// Kind of a named type declared by a schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
}

/// One argument declared on a root field.
#[derive(Clone, Debug, PartialEq)]
pub struct ArgumentMeta {
    pub name: String,
    /// Full type text, e.g. `[ID!]!`.
    pub type_text: String,
}

/// Metadata captured for one root field.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldMeta {
    pub name: String,
    pub arguments: Vec<ArgumentMeta>,
    /// Unwrapped named return type, e.g. `User` for `[User!]!`.
    pub return_type: String,
    /// Full return type text as declared.
    pub type_text: String,
}

/// A parsed schema held as owned SDL plus an eagerly-built index of the
/// pieces the gateway needs at runtime: type kinds, root operation types and
/// their field metadata, and oneOf input types. Indexing up front keeps the
/// borrowed parser AST out of long-lived state.
#[derive(Clone, Debug)]
pub struct SourceSchema {
    sdl: String,
    types: HashMap<String, TypeKind>,
    root_types: HashMap<OperationKind, String>,
    root_fields: HashMap<OperationKind, Vec<FieldMeta>>,
    one_of_inputs: HashSet<String>,
    declares_one_of: bool,
}

impl SourceSchema {
    /// A schema with no types and no root fields. What unifying zero sources
    /// produces.
    pub fn empty() -> Self {
        SourceSchema {
            sdl: String::new(),
            types: HashMap::new(),
            root_types: HashMap::new(),
            root_fields: HashMap::new(),
            one_of_inputs: HashSet::new(),
            declares_one_of: false,
        }
    }

    pub fn parse(sdl: &str) -> Result<Self, MeshError> {
        let document =
            parse_schema::<String>(sdl).map_err(|e| MeshError::Schema(e.to_string()))?;

        let mut types = HashMap::new();
        let mut object_fields: HashMap<String, Vec<FieldMeta>> = HashMap::new();
        let mut one_of_inputs = HashSet::new();
        let mut declares_one_of = false;
        let mut declared_roots: HashMap<OperationKind, String> = HashMap::new();

        for definition in &document.definitions {
            match definition {
                Definition::SchemaDefinition(schema_def) => {
                    if let Some(name) = &schema_def.query {
                        declared_roots.insert(OperationKind::Query, name.clone());
                    }
                    if let Some(name) = &schema_def.mutation {
                        declared_roots.insert(OperationKind::Mutation, name.clone());
                    }
                    if let Some(name) = &schema_def.subscription {
                        declared_roots.insert(OperationKind::Subscription, name.clone());
                    }
                }
                Definition::TypeDefinition(typedef) => match typedef {
                    TypeDefinition::Object(obj) => {
                        types.insert(obj.name.clone(), TypeKind::Object);
                        let fields = obj
                            .fields
                            .iter()
                            .map(|field| FieldMeta {
                                name: field.name.clone(),
                                arguments: field
                                    .arguments
                                    .iter()
                                    .map(|arg| ArgumentMeta {
                                        name: arg.name.clone(),
                                        type_text: type_text(&arg.value_type),
                                    })
                                    .collect(),
                                return_type: unwrap_named(&field.field_type).to_string(),
                                type_text: type_text(&field.field_type),
                            })
                            .collect();
                        object_fields.insert(obj.name.clone(), fields);
                    }
                    TypeDefinition::Interface(iface) => {
                        types.insert(iface.name.clone(), TypeKind::Interface);
                    }
                    TypeDefinition::Union(union_type) => {
                        types.insert(union_type.name.clone(), TypeKind::Union);
                    }
                    TypeDefinition::Scalar(scalar) => {
                        types.insert(scalar.name.clone(), TypeKind::Scalar);
                    }
                    TypeDefinition::Enum(enum_type) => {
                        types.insert(enum_type.name.clone(), TypeKind::Enum);
                    }
                    TypeDefinition::InputObject(input) => {
                        types.insert(input.name.clone(), TypeKind::InputObject);
                        if input.directives.iter().any(|d| d.name == "oneOf") {
                            one_of_inputs.insert(input.name.clone());
                            declares_one_of = true;
                        }
                    }
                },
                Definition::DirectiveDefinition(directive) => {
                    if directive.name == "oneOf" {
                        declares_one_of = true;
                    }
                }
                Definition::TypeExtension(_) => {}
            }
        }

        let mut root_types = HashMap::new();
        let mut root_fields = HashMap::new();
        for kind in [
            OperationKind::Query,
            OperationKind::Mutation,
            OperationKind::Subscription,
        ] {
            let root_name = declared_roots
                .get(&kind)
                .cloned()
                .unwrap_or_else(|| kind.default_root_type().to_string());
            if let Some(fields) = object_fields.get(&root_name) {
                root_types.insert(kind, root_name);
                root_fields.insert(kind, fields.clone());
            }
        }

        Ok(SourceSchema {
            sdl: sdl.to_string(),
            types,
            root_types,
            root_fields,
            one_of_inputs,
            declares_one_of,
        })
    }

    pub fn sdl(&self) -> &str {
        &self.sdl
    }

    /// Name of the root type for the operation kind, when the schema has one.
    pub fn root_type(&self, kind: OperationKind) -> Option<&str> {
        self.root_types.get(&kind).map(String::as_str)
    }

    pub fn root_fields(&self, kind: OperationKind) -> &[FieldMeta] {
        self.root_fields.get(&kind).map_or(&[], Vec::as_slice)
    }

    pub fn root_field(&self, kind: OperationKind, name: &str) -> Option<&FieldMeta> {
        self.root_fields(kind).iter().find(|f| f.name == name)
    }

    /// Composite types need a selection when fetched; leaf types do not.
    /// Unknown names (built-in scalars among them) count as leaves.
    pub fn is_composite(&self, type_name: &str) -> bool {
        matches!(
            self.types.get(type_name),
            Some(TypeKind::Object | TypeKind::Interface | TypeKind::Union)
        )
    }

    pub fn type_kind(&self, type_name: &str) -> Option<TypeKind> {
        self.types.get(type_name).copied()
    }

    /// Whether the schema declares the `@oneOf` directive or marks any input
    /// type with it.
    pub fn declares_one_of(&self) -> bool {
        self.declares_one_of
    }

    pub fn is_one_of_input(&self, type_name: &str) -> bool {
        self.one_of_inputs.contains(type_name)
    }
}

/// Prints a schema type reference back to SDL text.
pub(crate) fn type_text(ty: &schema::Type<'_, String>) -> String {
    match ty {
        schema::Type::NamedType(name) => name.clone(),
        schema::Type::ListType(inner) => format!("[{}]", type_text(inner)),
        schema::Type::NonNullType(inner) => format!("{}!", type_text(inner)),
    }
}

/// Unwraps list and non-null wrappers down to the named type.
pub(crate) fn unwrap_named<'a>(ty: &'a schema::Type<'_, String>) -> &'a str {
    match ty {
        schema::Type::NamedType(name) => name,
        schema::Type::ListType(inner) => unwrap_named(inner),
        schema::Type::NonNullType(inner) => unwrap_named(inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SDL: &str = r#"
        type Query {
            user(id: ID!): User
            version: String!
        }

        type Mutation {
            createUser(input: UserInput!): User
        }

        type User {
            id: ID!
            name: String!
        }

        input UserInput @oneOf {
            byId: ID
            byName: String
        }

        directive @oneOf on INPUT_OBJECT
    "#;

    #[test]
    fn indexes_root_fields() {
        let schema = SourceSchema::parse(SDL).unwrap();
        assert_eq!(schema.root_type(OperationKind::Query), Some("Query"));
        assert_eq!(schema.root_type(OperationKind::Subscription), None);

        let user = schema.root_field(OperationKind::Query, "user").unwrap();
        assert_eq!(user.return_type, "User");
        assert_eq!(user.arguments[0].name, "id");
        assert_eq!(user.arguments[0].type_text, "ID!");

        let version = schema.root_field(OperationKind::Query, "version").unwrap();
        assert_eq!(version.type_text, "String!");
    }

    #[test]
    fn classifies_types() {
        let schema = SourceSchema::parse(SDL).unwrap();
        assert!(schema.is_composite("User"));
        assert!(!schema.is_composite("UserInput"));
        assert!(!schema.is_composite("String"));
    }

    #[test]
    fn detects_one_of() {
        let schema = SourceSchema::parse(SDL).unwrap();
        assert!(schema.declares_one_of());
        assert!(schema.is_one_of_input("UserInput"));
        assert!(!schema.is_one_of_input("User"));
    }

    #[test]
    fn honors_explicit_schema_block() {
        let sdl = r#"
            schema { query: Root }
            type Root { ping: String }
        "#;
        let schema = SourceSchema::parse(sdl).unwrap();
        assert_eq!(schema.root_type(OperationKind::Query), Some("Root"));
        assert_eq!(schema.root_fields(OperationKind::Query).len(), 1);
    }

    #[test]
    fn rejects_invalid_sdl() {
        assert!(SourceSchema::parse("type {").is_err());
    }
}
