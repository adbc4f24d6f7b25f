use featherbone_core::{
    Assignment, Catalog, DataSource, DataSourceError, MemoryDataSource, Method, Model, ModelError,
};
use serde_json::json;
use speculate2::speculate;
use tokio_test::block_on;

fn contact_catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog
        .load(json!({
            "Contact": {
                "plural": "Contacts",
                "properties": {
                    "id": {"default": "createId()"},
                    "first": {"type": "string"},
                    "last": {"type": "string"},
                    "active": {"type": "boolean", "default": true}
                }
            }
        }))
        .expect("Failed to load catalog");
    catalog
}

fn fetched_contact(catalog: &Catalog, ds: &MemoryDataSource) -> Model {
    let record = ds
        .insert("contact", json!({"id": "c1", "first": "Ann", "last": "Lee"}))
        .expect("Failed to seed record");
    let feather = catalog.get_feather("Contact").expect("Contact feather");
    Model::from_fetched(feather, catalog.factories(), &record)
}

speculate! {
    before {
        let catalog = contact_catalog();
        let ds = MemoryDataSource::new().with_collection("contacts", "contact");
    }

    describe "construction" {
        it "starts in ready new" {
            let model = catalog.create("Contact").expect("Failed to create");
            assert_eq!(model.state(), "/ready/new");
        }

        it "resolves factory defaults once at creation" {
            let model = catalog.create("Contact").expect("Failed to create");
            let id = model.id().expect("id generated");
            assert!(!id.is_empty());
            assert_ne!(Some(id.clone()), catalog.create("Contact").unwrap().id());

            model.borrow_mut().set_value("first", json!("Ann")).unwrap();
            block_on(model.save(&ds)).expect("Failed to save");
            assert_eq!(model.id(), Some(id.clone()));
            assert!(ds.record("contact", &id).is_some());
        }

        it "applies literal and implicit defaults" {
            let model = catalog.create("Contact").expect("Failed to create");
            let instance = model.borrow();
            assert_eq!(instance.value("active"), Some(&json!(true)));
            assert_eq!(instance.value("isDeleted"), Some(&json!(false)));
            assert_eq!(instance.value("first"), Some(&serde_json::Value::Null));
        }
    }

    describe "save" {
        it "posts a new record and lands clean" {
            let model = catalog.create("Contact").expect("Failed to create");
            model.borrow_mut().set_value("first", json!("Ann")).unwrap();
            assert_eq!(model.state(), "/ready/new");

            let request = model.borrow_mut().begin_save().unwrap().expect("request");
            assert_eq!(request.method, Method::Post);
            assert_eq!(request.path, "/data/contact");
            assert_eq!(model.state(), "/busy/saving/posting");

            let result = block_on(ds.request(request));
            model.borrow_mut().complete(result).expect("Failed to complete");
            assert_eq!(model.state(), "/ready/fetched/clean");
            assert_eq!(model.borrow().etag(), Some("v1"));
        }

        it "patches a dirty record" {
            let model = fetched_contact(&catalog, &ds);
            assert_eq!(
                model.borrow_mut().set_value("first", json!("Bea")).unwrap(),
                Assignment::Changed
            );
            assert_eq!(model.state(), "/ready/fetched/dirty");

            block_on(model.save(&ds)).expect("Failed to save");
            assert_eq!(model.state(), "/ready/fetched/clean");
            assert_eq!(ds.record("contact", "c1").unwrap()["first"], json!("Bea"));

            let last = ds.requests().pop().expect("request sent");
            assert_eq!(last.method, Method::Patch);
            assert_eq!(last.etag.as_deref(), Some("v1"));
        }

        it "ignores save on a clean record" {
            let model = fetched_contact(&catalog, &ds);
            block_on(model.save(&ds)).expect("Failed to save");
            assert_eq!(model.state(), "/ready/fetched/clean");
            assert!(ds.requests().is_empty());
        }

        it "keeps local edits and stays dirty on conflict" {
            let model = fetched_contact(&catalog, &ds);
            ds.touch("contact", "c1", json!({"last": "Remote"}));
            model.borrow_mut().set_value("first", json!("Bea")).unwrap();

            let err = block_on(model.save(&ds)).unwrap_err();
            assert!(matches!(err, ModelError::Conflict(_)));
            assert!(err.is_recoverable());
            assert_eq!(model.state(), "/ready/fetched/dirty");
            assert_eq!(model.borrow().value("first"), Some(&json!("Bea")));
            assert!(model.borrow().last_error().is_some());
        }

        it "returns a conflicting post to new" {
            ds.insert("contact", json!({"id": "dup"})).unwrap();
            let model = catalog.create("Contact").expect("Failed to create");
            model.borrow_mut().set(&json!({"id": "dup"}), false);

            let err = block_on(model.save(&ds)).unwrap_err();
            assert!(matches!(err, ModelError::Conflict(_)));
            assert_eq!(model.state(), "/ready/new");
        }

        it "drops a second save while the first is in flight" {
            let model = catalog.create("Contact").expect("Failed to create");
            let first = model.borrow_mut().begin_save().unwrap();
            assert!(first.is_some());

            let second = model.borrow_mut().begin_save().unwrap();
            assert!(second.is_none());
            assert!(!model.borrow().can_handle("save"));
            assert_eq!(model.state(), "/busy/saving/posting");
        }
    }

    describe "fetch" {
        it "populates silently and lands clean" {
            ds.insert("contact", json!({"id": "c9", "first": "Ann"})).unwrap();
            let feather = catalog.get_feather("Contact").unwrap();
            let model = Model::from_fetched(feather, catalog.factories(), &json!({"id": "c9"}));

            block_on(model.fetch(&ds)).expect("Failed to fetch");
            assert_eq!(model.state(), "/ready/fetched/clean");
            assert_eq!(model.borrow().value("first"), Some(&json!("Ann")));
            assert_eq!(model.borrow().etag(), Some("v1"));
        }

        it "discards local edits of a dirty record" {
            let model = fetched_contact(&catalog, &ds);
            model.borrow_mut().set_value("first", json!("Local")).unwrap();

            block_on(model.fetch(&ds)).expect("Failed to fetch");
            assert_eq!(model.state(), "/ready/fetched/clean");
            assert_eq!(model.borrow().value("first"), Some(&json!("Ann")));
        }

        it "lands in error on transport failure" {
            let model = fetched_contact(&catalog, &ds);
            ds.fail_next(DataSourceError::Transport("connection reset".into()));

            let err = block_on(model.fetch(&ds)).unwrap_err();
            assert!(matches!(err, ModelError::DataSource(_)));
            assert!(!err.is_recoverable());
            assert_eq!(model.state(), "/error");
        }
    }

    describe "silent set" {
        it "does not dirty a clean record" {
            let model = fetched_contact(&catalog, &ds);
            model.borrow_mut().set(&json!({"first": "Quiet"}), true);
            assert_eq!(model.state(), "/ready/fetched/clean");
            assert_eq!(model.borrow().value("first"), Some(&json!("Quiet")));
        }

        it "dirties a clean record when loud" {
            let model = fetched_contact(&catalog, &ds);
            model.borrow_mut().set(&json!({"first": "Loud"}), false);
            assert_eq!(model.state(), "/ready/fetched/dirty");
        }
    }

    describe "terminal states" {
        it "absorbs every event in error" {
            let model = fetched_contact(&catalog, &ds);
            ds.fail_next(DataSourceError::status(500, "boom"));
            let _ = block_on(model.fetch(&ds));
            assert_eq!(model.state(), "/error");

            for event in ["fetch", "save", "delete", "changed", "fetched", "lock", "error"] {
                assert!(!model.borrow_mut().send(event).is_moved());
                assert_eq!(model.state(), "/error");
            }
            assert!(model.borrow_mut().begin_fetch().is_none());
        }

        it "absorbs every event in deleted" {
            let model = fetched_contact(&catalog, &ds);
            block_on(model.delete(&ds)).expect("Failed to delete");
            assert_eq!(model.state(), "/deleted");
            assert!(ds.record("contact", "c1").is_none());

            for event in ["fetch", "save", "delete", "changed", "unlock"] {
                assert!(!model.borrow_mut().send(event).is_moved());
                assert_eq!(model.state(), "/deleted");
            }
        }

        it "deletes an unsaved record without a request" {
            let model = catalog.create("Contact").expect("Failed to create");
            block_on(model.delete(&ds)).expect("Failed to delete");
            assert_eq!(model.state(), "/deleted");
            assert!(ds.requests().is_empty());
        }
    }

    describe "change hooks" {
        it "see old and new values around the swap" {
            let model = fetched_contact(&catalog, &ds);
            let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));

            let before = seen.clone();
            model.borrow_mut().on_change("first", move |slot| {
                before.borrow_mut().push(format!(
                    "{} -> {}",
                    slot.current_value(),
                    slot.pending_new_value().cloned().unwrap_or_default()
                ));
            }).unwrap();
            let after = seen.clone();
            model.borrow_mut().on_changed("first", move |slot| {
                after.borrow_mut().push(format!("was {}", slot.previous_value()));
            }).unwrap();

            model.borrow_mut().set_value("first", json!("Bea")).unwrap();
            assert_eq!(*seen.borrow(), vec!["\"Ann\" -> \"Bea\"", "was \"Ann\""]);
        }

        it "rejects hooks on unknown properties" {
            let model = fetched_contact(&catalog, &ds);
            let result = model.borrow_mut().on_change("nickname", |_| {});
            assert!(matches!(result, Err(ModelError::UnknownProperty { .. })));
        }
    }
}
