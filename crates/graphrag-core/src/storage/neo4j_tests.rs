use super::*;
use wiremock::matchers::{header, method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

/// Matches a transaction whose first statement contains `needle`.
struct CypherContains(&'static str);

impl Match for CypherContains {
    fn matches(&self, request: &Request) -> bool {
        serde_json::from_slice::<Value>(&request.body)
            .ok()
            .and_then(|body| body["statements"][0]["statement"].as_str().map(|s| s.contains(self.0)))
            .unwrap_or(false)
    }
}

fn rows(values: Vec<Value>) -> Value {
    json!({
        "results": [{ "columns": ["x"], "data": values.into_iter().map(|v| json!({ "row": [v] })).collect::<Vec<_>>() }],
        "errors": []
    })
}

fn empty_ok() -> Value {
    json!({ "results": [], "errors": [] })
}

async fn server_with_handshake() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/neo4j/tx/commit"))
        .and(CypherContains("RETURN 1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows(vec![json!(1)])))
        .expect(1)
        .mount(&server)
        .await;
    server
}

fn store_for(server: &MockServer) -> Neo4jGraphStore {
    let conn = Arc::new(Neo4jConnection::new(Neo4jConfig {
        url: server.uri(),
        username: "neo4j".into(),
        password: Some("secret".into()),
        database: "neo4j".into(),
    }));
    Neo4jGraphStore::new(conn, "kb1")
}

#[tokio::test]
async fn test_add_nodes_sends_merge_with_basic_auth() {
    let server = server_with_handshake().await;
    Mock::given(method("POST"))
        .and(path("/db/neo4j/tx/commit"))
        .and(header("Authorization", "Basic bmVvNGo6c2VjcmV0"))
        .and(CypherContains("MERGE (e:Entity"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_ok()))
        .expect(2)
        .mount(&server)
        .await;

    let store = store_for(&server);
    let mut node = GraphNode::new("acme::org", "org", "Acme", "Rocket maker");
    node.properties.insert("founded".into(), json!(1999));
    store.add_nodes(vec![node.clone()]).await.unwrap();
    store.add_nodes(vec![node]).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[1].body).unwrap();
    let params = &body["statements"][0]["parameters"];
    assert_eq!(params["store"], "kb1");
    assert_eq!(params["nodes"][0]["id"], "acme::org");
    // Nested maps are flattened to a JSON string.
    assert_eq!(params["nodes"][0]["properties"], "{\"founded\":1999}");
}

#[tokio::test]
async fn test_get_node_decodes_projection() {
    let server = server_with_handshake().await;
    Mock::given(method("POST"))
        .and(CypherContains("RETURN e {"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows(vec![json!({
            "id": "acme::org",
            "type": "org",
            "name": "Acme",
            "description": null,
            "properties": "{\"founded\":1999}",
            "sourceChunkIds": ["doc#0"],
            "embedding": [1.0, 0.0],
            "communityId": "community-0"
        })])))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let node = store.get_node("acme::org").await.unwrap().expect("node present");
    assert_eq!(node.name, "Acme");
    assert_eq!(node.description, "");
    assert_eq!(node.properties["founded"], 1999);
    assert_eq!(node.properties[COMMUNITY_ID_PROPERTY], "community-0");
    assert_eq!(node.source_chunk_ids, vec!["doc#0"]);
    assert_eq!(node.embedding, Some(vec![1.0, 0.0]));
}

#[tokio::test]
async fn test_get_neighbors_reads_both_statements() {
    let server = server_with_handshake().await;
    Mock::given(method("POST"))
        .and(CypherContains("RELATES*0..2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                { "data": [
                    { "row": [{ "id": "a", "type": "t", "name": "A" }, 0] },
                    { "row": [{ "id": "b", "type": "t", "name": "B" }, 1] }
                ] },
                { "data": [
                    { "row": [{ "id": "a -> knows -> b", "type": "knows", "sourceId": "a", "targetId": "b", "weight": 0.5 }] }
                ] }
            ],
            "errors": []
        })))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let hood = store.get_neighbors("a", 2).await.unwrap();
    assert_eq!(hood.nodes.len(), 2);
    assert_eq!(hood.nodes[0].id, "a");
    assert_eq!(hood.edges.len(), 1);
    assert_eq!(hood.edges[0].weight, 0.5);
}

#[tokio::test]
async fn test_vector_search_ranks_client_side() {
    let server = server_with_handshake().await;
    Mock::given(method("POST"))
        .and(CypherContains("e.embedding IS NOT NULL"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows(vec![
            json!({ "id": "b", "type": "t", "name": "B", "embedding": [0.0, 1.0] }),
            json!({ "id": "a", "type": "t", "name": "A", "embedding": [1.0, 0.0] }),
        ])))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let hits = store.find_nodes_by_embedding(&[1.0, 0.0], 1).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "a");
}

#[tokio::test]
async fn test_cypher_error_is_surfaced() {
    let server = server_with_handshake().await;
    Mock::given(method("POST"))
        .and(CypherContains("DETACH DELETE"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [],
            "errors": [{ "code": "Neo.ClientError.Statement.SyntaxError", "message": "bad" }]
        })))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let err = store.clear().await.unwrap_err();
    let db_err = err.downcast_ref::<GraphDbError>().expect("typed error");
    assert!(matches!(db_err, GraphDbError::Cypher { code, .. } if code.ends_with("SyntaxError")));
}

#[tokio::test]
async fn test_set_communities_caches_locally() {
    let server = server_with_handshake().await;
    Mock::given(method("POST"))
        .and(CypherContains("REMOVE e.communityId"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_ok()))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    let communities = vec![Community::new("community-0", vec!["a".into(), "b".into()])];
    store.set_communities(communities.clone()).await.unwrap();
    assert_eq!(store.get_communities().await.unwrap(), communities);

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(body["statements"][1]["parameters"]["assignments"][1]["nodeId"], "b");
}

#[tokio::test]
async fn test_unreachable_database_is_fatal() {
    let conn = Arc::new(Neo4jConnection::new(Neo4jConfig {
        url: "http://127.0.0.1:1".into(),
        username: "neo4j".into(),
        password: None,
        database: "neo4j".into(),
    }));
    let store = Neo4jGraphStore::new(conn, "kb1");

    let err = store.get_all_nodes().await.unwrap_err();
    assert!(matches!(err.downcast_ref::<GraphDbError>(), Some(GraphDbError::Connect { .. })));
}

#[tokio::test]
async fn test_http_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let err = store.get_all_edges().await.unwrap_err();
    assert!(matches!(err.downcast_ref::<GraphDbError>(), Some(GraphDbError::Status { status: 401, .. })));
}
