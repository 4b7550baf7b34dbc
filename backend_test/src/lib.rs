use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    parse_macro_input, spanned::Spanned, FnArg, GenericArgument, Ident, ItemFn, Pat, PathArguments,
    Signature, Type,
};

/// Transform an asynchronous test into a synchronous one that runs against a
/// fresh MongoDB database, inject dependencies, and ensure that the database
/// is dropped regardless of how the test terminates.
///
/// Injectable dependencies are [`rocket::local::asynchronous::Client`],
/// [`mongodb::Database`], [`crate::ledger::MongoLedger`] and
/// [`crate::model::mongodb::Coll<T>`].
///
/// If no database is configured (`ROCKET_DB_URI` unset), the test is skipped.
#[proc_macro_attribute]
pub fn backend_test(_args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item_fn = parse_macro_input!(input as ItemFn);

    // Extract type information and reject invalid function signatures.
    let (test_args, collection_idents, collection_types) = match check_sig(&item_fn.sig) {
        Ok(args) => args,
        Err(err) => {
            return err.into_compile_error().into();
        }
    };

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    // Rewrite the test function.
    quote! {
        #[test]
        #[allow(unused_variables)]
        fn #name() {
            /// Test setup.
            async fn setup() -> Option<(
                rocket::local::asynchronous::Client,
                mongodb::Database,
                crate::ledger::MongoLedger,
            )> {
                crate::logging::init_test_logging();
                let db_client = crate::db_client().await?;
                let db = db_client.database(&crate::database());
                crate::model::mongodb::ensure_indexes_exist(&db).await.unwrap();
                let ledger = crate::ledger::MongoLedger::new(db_client, &db);
                let rocket = crate::rocket_for_ledger(
                    std::sync::Arc::new(ledger.clone()),
                    crate::engine::RetryPolicy::default(),
                );
                let rocket_client = rocket::local::asynchronous::Client::tracked(rocket)
                    .await
                    .unwrap();
                Some((rocket_client, db, ledger))
            }

            /// The test itself.
            #item_fn

            /// Test cleanup.
            async fn cleanup(db: mongodb::Database) {
                db.drop(None).await.unwrap();
            }

            // Create an async runtime. We need a separate one for inside and
            // outside the `catch_unwind`.
            let outer_runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("test-setup-cleanup")
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();
            let inner_runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("rocket-worker-test-thread")
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            // Run the setup, or skip if there is nowhere to run.
            let Some((rocket_client, db, ledger)) = outer_runtime.block_on(setup()) else {
                eprintln!("Skipping {}: no test database configured", stringify!(#name));
                return;
            };

            // Run the test, catching any panics.
            // Use mutexes to safely transfer `!UnwindSafe` data.
            let client_mutex = std::sync::Mutex::new(rocket_client);
            let db_mutex = std::sync::Mutex::new(db.clone());
            let ledger_mutex = std::sync::Mutex::new(ledger);
            let runtime_mutex = std::sync::Mutex::new(inner_runtime);
            let result = std::panic::catch_unwind(|| {
                let rocket_client = client_mutex.into_inner().unwrap();
                let db = db_mutex.into_inner().unwrap();
                let ledger = ledger_mutex.into_inner().unwrap();
                let runtime = runtime_mutex.into_inner().unwrap();

                #(
                    let #collection_idents = crate::model::mongodb::Coll::<#collection_types>::from_db(&db);
                )*

                runtime.block_on(#new_name(#(#test_args),*));
            });

            // Run the cleanup.
            outer_runtime.block_on(cleanup(db));

            // If the test panicked, re-raise the panic.
            if let Err(cause) = result {
                std::panic::resume_unwind(cause);
            }
        }
    }
    .into()
}

/// Ensure the wrapped test is async, extract parameters to inject, and reject
/// unknown parameters.
#[allow(clippy::type_complexity)]
fn check_sig(sig: &Signature) -> Result<(Vec<TokenStream2>, Vec<Ident>, Vec<Ident>), syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut has_client = false;
    let mut has_db = false;
    let mut has_ledger = false;
    let mut args = vec![];
    let mut collection_idents = vec![];
    let mut collection_types = vec![];

    for input in &sig.inputs {
        let FnArg::Typed(pat_type) = input else {
            return Err(unexpected(input));
        };
        let (Pat::Ident(pat_ident), Type::Path(type_path)) = (&*pat_type.pat, &*pat_type.ty) else {
            return Err(unexpected(input));
        };

        if let Some(type_ident) = type_path.path.get_ident() {
            let (seen, injected) = if type_ident == "Client" {
                (&mut has_client, quote! { rocket_client })
            } else if type_ident == "Database" {
                (&mut has_db, quote! { db.clone() })
            } else if type_ident == "MongoLedger" {
                (&mut has_ledger, quote! { ledger.clone() })
            } else {
                return Err(unexpected(input));
            };
            if *seen {
                return Err(syn::Error::new(
                    input.span(),
                    format!("Test cannot accept more than one `{type_ident}`"),
                ));
            }
            *seen = true;
            args.push(injected);
            continue;
        }

        // Valid as the last path segment for any type is itself.
        if let Some(possible_collection) = type_path.path.segments.last() {
            if possible_collection.ident == "Coll" {
                if let PathArguments::AngleBracketed(generics) = &possible_collection.arguments {
                    if let Some(GenericArgument::Type(Type::Path(type_path))) =
                        generics.args.first()
                    {
                        if let Some(type_ident) = type_path.path.get_ident() {
                            let ident = pat_ident.ident.clone();
                            args.push(quote! { #ident });
                            collection_idents.push(ident);
                            collection_types.push(type_ident.clone());
                            continue;
                        }
                    }
                }
            }
        }

        return Err(unexpected(input));
    }

    Ok((args, collection_idents, collection_types))
}

fn unexpected(input: &FnArg) -> syn::Error {
    syn::Error::new(
        input.span(),
        "Expected one of `client: Client`, `db: Database`, `ledger: MongoLedger` or `collection: Coll<T>`",
    )
}
