use std::io::Write as _;
use std::path::Path;

use zip::write::SimpleFileOptions;

use crate::error::{DownloadError, io_to_download};
use crate::source::PageAsset;

/// Metadata embedded in the assembled artifact.
#[derive(Debug, Clone)]
pub struct ChapterMeta {
    pub number: u32,
    pub title: String,
    /// BCP-47 language tag for the EPUB metadata and XHTML documents.
    pub language: String,
}

/// Assembles page images, in index order, into an EPUB 3 at `out_path`.
/// One XHTML document per manga page, each showing a single centered image.
/// Blocking; callers on the async runtime wrap this in `spawn_blocking`.
pub fn assemble(
    meta: &ChapterMeta,
    pages: &[PageAsset],
    out_path: &Path,
) -> Result<(), DownloadError> {
    if pages.is_empty() {
        return Err(DownloadError::AssemblyFailure(format!(
            "chapter {} has no pages to assemble",
            meta.number
        )));
    }

    let out_file = std::fs::File::create(out_path).map_err(io_to_download)?;
    let mut zip = zip::ZipWriter::new(out_file);

    // Per EPUB spec, `mimetype` MUST be the first entry and MUST be stored
    // (no compression).
    let mimetype_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    let deflated_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let write_err = |err: zip::result::ZipError| match err {
        zip::result::ZipError::Io(io) => io_to_download(io),
        other => DownloadError::AssemblyFailure(other.to_string()),
    };

    zip.start_file("mimetype", mimetype_options)
        .map_err(write_err)?;
    zip.write_all(b"application/epub+zip")
        .map_err(io_to_download)?;

    zip.start_file("META-INF/container.xml", deflated_options)
        .map_err(write_err)?;
    zip.write_all(render_container_xml().as_bytes())
        .map_err(io_to_download)?;

    zip.start_file("OEBPS/content.opf", deflated_options)
        .map_err(write_err)?;
    zip.write_all(render_content_opf(meta, pages).as_bytes())
        .map_err(io_to_download)?;

    zip.start_file("OEBPS/nav.xhtml", deflated_options)
        .map_err(write_err)?;
    zip.write_all(render_nav_xhtml(meta, pages.len()).as_bytes())
        .map_err(io_to_download)?;

    zip.start_file("OEBPS/toc.ncx", deflated_options)
        .map_err(write_err)?;
    zip.write_all(render_toc_ncx(meta, pages.len()).as_bytes())
        .map_err(io_to_download)?;

    zip.start_file("OEBPS/style.css", deflated_options)
        .map_err(write_err)?;
    zip.write_all(PAGE_CSS.as_bytes()).map_err(io_to_download)?;

    for page in pages {
        zip.start_file(format!("OEBPS/{}", image_name(page)), deflated_options)
            .map_err(write_err)?;
        zip.write_all(&page.bytes).map_err(io_to_download)?;

        zip.start_file(
            format!("OEBPS/{}", page_doc_name(page.page_index)),
            deflated_options,
        )
        .map_err(write_err)?;
        zip.write_all(render_page_xhtml(meta, page).as_bytes())
            .map_err(io_to_download)?;
    }

    let out_file = zip.finish().map_err(write_err)?;
    out_file.sync_all().map_err(io_to_download)?;
    Ok(())
}

/// Prefix shared by all per-page XHTML entries; the catalog rescan counts
/// these to re-derive a lost record's page count.
pub const PAGE_DOC_PREFIX: &str = "OEBPS/page-";

pub fn page_doc_name(page_index: u32) -> String {
    format!("page-{:03}.xhtml", page_index + 1)
}

fn image_name(page: &PageAsset) -> String {
    format!(
        "images/page-{:03}.{}",
        page.page_index + 1,
        image_ext(&page.media_type)
    )
}

fn image_ext(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "jpg",
    }
}

fn render_container_xml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#
    .to_string()
}

const PAGE_CSS: &str = r#"@charset "utf-8";

body { margin: 0; padding: 0; text-align: center; background-color: white; }
img { max-width: 100%; max-height: 100vh; height: auto; width: auto; display: block; margin: 0 auto; }
"#;

fn render_content_opf(meta: &ChapterMeta, pages: &[PageAsset]) -> String {
    let uuid = uuid::Uuid::new_v4();
    let modified = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let title = format!("Kapitel {}: {}", meta.number, meta.title);

    let mut manifest = String::new();
    let mut spine = String::new();
    for page in pages {
        let n = page.page_index + 1;
        manifest.push_str(&format!(
            "    <item id=\"page{n}\" href=\"{}\" media-type=\"application/xhtml+xml\"/>\n",
            page_doc_name(page.page_index)
        ));
        manifest.push_str(&format!(
            "    <item id=\"img{n}\" href=\"{}\" media-type=\"{}\"/>\n",
            image_name(page),
            xml_escape(&page.media_type)
        ));
        spine.push_str(&format!("    <itemref idref=\"page{n}\"/>\n"));
    }

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="book-id">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="book-id">urn:uuid:{uuid}</dc:identifier>
    <dc:title>{title}</dc:title>
    <dc:language>{lang}</dc:language>
    <meta property="dcterms:modified">{modified}</meta>
  </metadata>
  <manifest>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    <item id="css" href="style.css" media-type="text/css"/>
{manifest}  </manifest>
  <spine toc="ncx">
{spine}  </spine>
</package>
"#,
        uuid = uuid,
        title = xml_escape(&title),
        lang = xml_escape(&meta.language),
        modified = modified,
        manifest = manifest,
        spine = spine,
    )
}

fn render_nav_xhtml(meta: &ChapterMeta, page_count: usize) -> String {
    let lang = xml_escape(&meta.language);
    let title = xml_escape(&format!("Kapitel {}: {}", meta.number, meta.title));

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"{lang}\" xml:lang=\"{lang}\">\n"
    ));
    out.push_str(&format!(
        "<head>\n  <title>{title}</title>\n  <meta charset=\"utf-8\" />\n</head>\n<body>\n"
    ));
    out.push_str("  <nav epub:type=\"toc\">\n    <ol>\n");
    for index in 0..page_count {
        out.push_str(&format!(
            "      <li><a href=\"{}\">Seite {}</a></li>\n",
            page_doc_name(index as u32),
            index + 1
        ));
    }
    out.push_str("    </ol>\n  </nav>\n</body>\n</html>\n");
    out
}

fn render_toc_ncx(meta: &ChapterMeta, page_count: usize) -> String {
    let title = xml_escape(&format!("Kapitel {}: {}", meta.number, meta.title));

    let mut nav_points = String::new();
    for index in 0..page_count {
        let n = index + 1;
        nav_points.push_str(&format!(
            "    <navPoint id=\"page{n}\" playOrder=\"{n}\">\n      <navLabel><text>Seite {n}</text></navLabel>\n      <content src=\"{}\"/>\n    </navPoint>\n",
            page_doc_name(index as u32)
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
    <meta name="dtb:depth" content="1"/>
  </head>
  <docTitle><text>{title}</text></docTitle>
  <navMap>
{nav_points}  </navMap>
</ncx>
"#
    )
}

fn render_page_xhtml(meta: &ChapterMeta, page: &PageAsset) -> String {
    let lang = xml_escape(&meta.language);
    let n = page.page_index + 1;
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" lang="{lang}" xml:lang="{lang}">
<head>
  <title>Seite {n}</title>
  <meta charset="utf-8" />
  <link rel="stylesheet" type="text/css" href="style.css" />
</head>
<body>
  <img src="{src}" alt="Seite {n}" />
</body>
</html>
"#,
        src = image_name(page),
    )
}

fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}
